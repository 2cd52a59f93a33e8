use crate::breaker::{BreakerConfig, BreakerManager};
use crate::client::{BackendClient, HttpBackendClient};
use crate::config::{Backend, OutboundLimits, Settings};
use crate::fanout::FanoutEngine;
use idcache::TranslationCache;
use serde_json::json;
use shared::metrics::Metrics;
use std::sync::Arc;

/// Everything one request needs, bundled per configuration generation.
///
/// The HTTP service holds `Arc<RwLock<Arc<ProxyCore>>>`; a SIGHUP reload
/// builds a fresh core and swaps the inner pointer, so in-flight requests
/// keep the generation they started with.
pub struct ProxyCore {
    pub settings: Settings,
    pub engine: FanoutEngine,
    pub cache: Arc<TranslationCache>,
}

impl ProxyCore {
    pub fn new(
        settings: Settings,
        backends: Vec<Backend>,
        breaker_config: BreakerConfig,
        outbound: OutboundLimits,
        cache: Arc<TranslationCache>,
        metrics: Metrics,
    ) -> Self {
        let client: Arc<dyn BackendClient> = Arc::new(HttpBackendClient::new(outbound));
        Self::with_client(settings, backends, breaker_config, cache, client, metrics)
    }

    /// Same wiring with an injected transport; the seam the tests use.
    pub fn with_client(
        settings: Settings,
        backends: Vec<Backend>,
        breaker_config: BreakerConfig,
        cache: Arc<TranslationCache>,
        client: Arc<dyn BackendClient>,
        metrics: Metrics,
    ) -> Self {
        let breakers =
            BreakerManager::new(backends.iter().map(|b| b.name.clone()), breaker_config);
        let engine = FanoutEngine::new(
            backends,
            settings.max_requests,
            settings.max_timeout,
            settings.dedup_types.clone(),
            breakers,
            client,
            Arc::clone(&cache),
            metrics,
        );

        ProxyCore {
            settings,
            engine,
            cache,
        }
    }

    pub fn has_backends(&self) -> bool {
        !self.engine.backends().is_empty()
    }

    /// Internal state snapshot served on the metrics path.
    pub fn stats(&self) -> serde_json::Value {
        json!({
            "connections": {
                "active_requests": self.engine.in_flight(),
                "http_clients": self.engine.clients_count(),
            },
            "cache": self.cache.stats(),
            "circuit_breakers": self.engine.breaker_stats(),
        })
    }

    /// Stops cache workers and writes the final snapshot.
    pub fn shutdown(&self) {
        self.cache.stop();
    }
}
