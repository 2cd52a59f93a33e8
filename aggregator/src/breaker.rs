//! Per-backend circuit breakers.
//!
//! State transitions:
//! - **Closed → Open** when consecutive failures reach the threshold
//! - **Open → HalfOpen** after the backoff timeout elapses
//! - **HalfOpen → Closed** on a reported success
//! - **HalfOpen → Open** on a reported failure (with increased backoff)
//!
//! A backend with an open breaker is skipped by the fan-out engine without
//! attempting a connection; the other backends continue.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half-open",
        }
    }
}

#[derive(Clone, Debug)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit trips.
    pub failure_threshold: u32,
    /// Base open period before a half-open probe is allowed.
    pub open_timeout: Duration,
    /// Cap on the backed-off open period.
    pub max_open_timeout: Duration,
    /// Open period multiplier per additional consecutive failure.
    pub backoff_multiplier: f64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        BreakerConfig {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(30),
            max_open_timeout: Duration::from_secs(300),
            backoff_multiplier: 2.0,
        }
    }
}

impl BreakerConfig {
    /// Open period after `consecutive_failures` failures:
    /// `open_timeout * multiplier^(failures - threshold)`, capped.
    fn backoff(&self, consecutive_failures: u32) -> Duration {
        let extra = consecutive_failures.saturating_sub(self.failure_threshold);
        let scaled = self.open_timeout.as_secs_f64() * self.backoff_multiplier.powi(extra as i32);
        Duration::from_secs_f64(scaled.min(self.max_open_timeout.as_secs_f64()))
    }
}

#[derive(Debug)]
struct Breaker {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl Breaker {
    fn new() -> Self {
        Breaker {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
        }
    }
}

/// Owns one breaker per backend name. Thread-safe; the per-breaker mutex is
/// held only for state bookkeeping, never across I/O.
pub struct BreakerManager {
    breakers: HashMap<String, Mutex<Breaker>>,
    config: BreakerConfig,
}

impl BreakerManager {
    pub fn new(backend_names: impl IntoIterator<Item = String>, config: BreakerConfig) -> Self {
        let breakers = backend_names
            .into_iter()
            .map(|name| (name, Mutex::new(Breaker::new())))
            .collect();
        BreakerManager { breakers, config }
    }

    /// Whether a request to `name` is admitted right now. Transitions an
    /// expired open circuit to half-open and admits the probe.
    pub fn allow_request(&self, name: &str) -> bool {
        let Some(slot) = self.breakers.get(name) else {
            // Unknown backends are not breaker-protected.
            return true;
        };

        let mut breaker = slot.lock();
        match breaker.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let waited = breaker
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if waited >= self.config.backoff(breaker.consecutive_failures) {
                    breaker.state = BreakerState::HalfOpen;
                    breaker.opened_at = None;
                    tracing::info!(backend = name, "Circuit breaker half-open, probing");
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn report_success(&self, name: &str) {
        if let Some(slot) = self.breakers.get(name) {
            let mut breaker = slot.lock();
            if breaker.state != BreakerState::Closed {
                tracing::info!(backend = name, "Circuit breaker closed");
            }
            breaker.state = BreakerState::Closed;
            breaker.consecutive_failures = 0;
            breaker.opened_at = None;
        }
    }

    pub fn report_failure(&self, name: &str) {
        if let Some(slot) = self.breakers.get(name) {
            let mut breaker = slot.lock();
            breaker.consecutive_failures += 1;

            let trip = match breaker.state {
                BreakerState::HalfOpen => true,
                BreakerState::Closed => {
                    breaker.consecutive_failures >= self.config.failure_threshold
                }
                BreakerState::Open => false,
            };
            if trip {
                breaker.state = BreakerState::Open;
                breaker.opened_at = Some(Instant::now());
                tracing::warn!(
                    backend = name,
                    failures = breaker.consecutive_failures,
                    "Circuit breaker open"
                );
            }
        }
    }

    /// Current state per backend, for the stats surface.
    pub fn stats(&self) -> HashMap<String, &'static str> {
        self.breakers
            .iter()
            .map(|(name, slot)| (name.clone(), slot.lock().state.as_str()))
            .collect()
    }

    #[cfg(test)]
    fn force_opened_at(&self, name: &str, at: Instant) {
        self.breakers.get(name).unwrap().lock().opened_at = Some(at);
    }
}
