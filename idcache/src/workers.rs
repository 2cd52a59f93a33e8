use crate::cache::TranslationCache;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, interval_at};

/// Spawns the TTL eviction and autosave loops. Both stop when the watch
/// channel fires. A zero interval disables the corresponding task.
pub(crate) fn spawn_all(cache: Arc<TranslationCache>, cancel: watch::Receiver<bool>) {
    let cleanup_interval = cache.config().cleanup_interval;
    let auto_save = cache.config().auto_save;

    if cleanup_interval.is_zero() {
        tracing::info!("Cleanup interval is not set, eviction worker disabled");
    } else {
        tokio::spawn(run_cleanup(cache.clone(), cleanup_interval, cancel.clone()));
    }

    if auto_save.is_zero() {
        tracing::info!("Autosave interval is not set, autosave worker disabled");
    } else {
        tokio::spawn(run_autosave(cache, auto_save, cancel));
    }
}

async fn run_cleanup(
    cache: Arc<TranslationCache>,
    period: Duration,
    mut cancel: watch::Receiver<bool>,
) {
    tracing::info!("Eviction worker started");
    let mut ticker = interval_at(Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let removed = cache.evict_expired();
                tracing::debug!(removed, "Cache eviction pass completed");
            }
            _ = cancel.changed() => break,
        }
    }
    tracing::info!("Eviction worker stopped");
}

async fn run_autosave(
    cache: Arc<TranslationCache>,
    period: Duration,
    mut cancel: watch::Receiver<bool>,
) {
    tracing::info!("Autosave worker started");
    let mut ticker = interval_at(Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match cache.save() {
                    Ok(()) => tracing::debug!("Periodic cache snapshot completed"),
                    Err(e) => tracing::warn!(error = %e, "Cache snapshot failed"),
                }
            }
            _ = cancel.changed() => break,
        }
    }
    tracing::info!("Autosave worker stopped");
}
