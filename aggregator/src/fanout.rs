//! Concurrent fan-out to the target backends and result aggregation.
//!
//! One task per target backend, each holding a slot from a process-wide
//! semaphore. Failures stay local to their task and are collected as
//! per-backend error strings; only the request deadline cancels peers.

use crate::breaker::BreakerManager;
use crate::client::BackendClient;
use crate::config::Backend;
use crate::planner::{self, Plan};
use crate::pool::{JsonMap, MapPool};
use crate::rewrite::{self, ResponseRewriter, SeenIds};
use idcache::TranslationCache;
use serde_json::Value;
use shared::metrics::Metrics;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

pub const TIMEOUT_ERROR: &str = "request timeout";
pub const NO_TARGETS_ERROR: &str = "no target servers for ID-based request";

enum TaskOutcome {
    Result(Value),
    Error(String),
    /// The backend dropped out of this fan-out without an error (rewrite
    /// left it nothing to ask for).
    Skip,
}

struct EngineInner {
    backends: Vec<Backend>,
    semaphore: Arc<Semaphore>,
    max_requests: usize,
    breakers: BreakerManager,
    client: Arc<dyn BackendClient>,
    cache: Arc<TranslationCache>,
    pool: MapPool,
    metrics: Metrics,
    dedup_types: Arc<Vec<String>>,
    max_timeout: Duration,
}

#[derive(Clone)]
pub struct FanoutEngine {
    inner: Arc<EngineInner>,
}

impl FanoutEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        backends: Vec<Backend>,
        max_requests: usize,
        max_timeout: Duration,
        dedup_types: Vec<String>,
        breakers: BreakerManager,
        client: Arc<dyn BackendClient>,
        cache: Arc<TranslationCache>,
        metrics: Metrics,
    ) -> Self {
        FanoutEngine {
            inner: Arc::new(EngineInner {
                backends,
                semaphore: Arc::new(Semaphore::new(max_requests)),
                max_requests,
                breakers,
                client,
                cache,
                pool: MapPool::new(),
                metrics,
                dedup_types: Arc::new(dedup_types),
                max_timeout,
            }),
        }
    }

    pub fn backends(&self) -> &[Backend] {
        &self.inner.backends
    }

    /// Outbound requests currently holding a semaphore slot.
    pub fn in_flight(&self) -> usize {
        self.inner
            .max_requests
            .saturating_sub(self.inner.semaphore.available_permits())
    }

    pub fn breaker_stats(&self) -> std::collections::HashMap<String, &'static str> {
        self.inner.breakers.stats()
    }

    pub fn clients_count(&self) -> usize {
        self.inner.client.clients_count()
    }

    /// Fans the request out and aggregates.
    ///
    /// Returns `(result, errors)`: `result` is a sequence (concatenated in
    /// arrival order), a key-merged map, or `Null` when no backend produced
    /// anything. On deadline expiry the single error is `request timeout`.
    pub async fn execute(&self, request: Arc<JsonMap>, trace_id: &str) -> (Value, Vec<String>) {
        let inner = &self.inner;
        let plan = Arc::new(planner::plan(&request, &inner.backends));

        tracing::debug!(
            trace_id,
            id_based = plan.id_based,
            fields = ?plan.id_fields,
            targets = ?plan.targets,
            "Routing plan"
        );

        if plan.id_based && plan.targets.is_empty() {
            tracing::warn!(trace_id, "No target servers for ID-based request");
            return (Value::Null, vec![NO_TARGETS_ERROR.to_string()]);
        }

        let seen = rewrite::new_seen_ids();
        let mut join_set = JoinSet::new();

        for backend in &inner.backends {
            if !plan.targets.contains(&backend.id) {
                continue;
            }
            join_set.spawn(dispatch(
                Arc::clone(&self.inner),
                backend.clone(),
                Arc::clone(&request),
                Arc::clone(&plan),
                seen.clone(),
                trace_id.to_string(),
            ));
        }

        self.collect(join_set, trace_id).await
    }

    async fn collect(
        &self,
        mut join_set: JoinSet<TaskOutcome>,
        trace_id: &str,
    ) -> (Value, Vec<String>) {
        let mut sequence: Vec<Value> = Vec::new();
        let mut merged = JsonMap::new();
        let mut errors: Vec<String> = Vec::new();

        let deadline = tokio::time::sleep(self.inner.max_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    tracing::warn!(trace_id, aborted = join_set.len(), "Fan-out deadline reached");
                    join_set.abort_all();
                    return (Value::Null, vec![TIMEOUT_ERROR.to_string()]);
                }
                joined = join_set.join_next() => match joined {
                    None => break,
                    Some(Ok(TaskOutcome::Result(value))) => match value {
                        Value::Array(items) => sequence.extend(items),
                        Value::Object(map) => {
                            for (key, value) in map {
                                if merged.contains_key(&key) {
                                    tracing::debug!(trace_id, key, "Overwriting merged result key");
                                }
                                merged.insert(key, value);
                            }
                        }
                        _ => {}
                    },
                    Some(Ok(TaskOutcome::Error(message))) => errors.push(message),
                    Some(Ok(TaskOutcome::Skip)) => {}
                    Some(Err(e)) => tracing::error!(trace_id, error = %e, "Fan-out task panicked"),
                },
            }
        }

        let result = if !sequence.is_empty() {
            Value::Array(sequence)
        } else if !merged.is_empty() {
            Value::Object(merged)
        } else {
            Value::Null
        };
        (result, errors)
    }
}

async fn dispatch(
    inner: Arc<EngineInner>,
    backend: Backend,
    request: Arc<JsonMap>,
    plan: Arc<Plan>,
    seen: SeenIds,
    trace_id: String,
) -> TaskOutcome {
    // Slot released on every return path when the permit drops.
    let _permit = match Arc::clone(&inner.semaphore).acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return TaskOutcome::Skip,
    };

    if !inner.breakers.allow_request(&backend.name) {
        tracing::warn!(
            trace_id,
            backend_id = backend.id,
            url = backend.url,
            "Circuit breaker open, skipping backend"
        );
        return TaskOutcome::Error(format!("server {}: circuit breaker open", backend.id));
    }

    let Some(server_request) =
        planner::rewrite_for_backend(&inner.pool, &request, &backend, &plan, &inner.cache)
    else {
        tracing::debug!(trace_id, backend_id = backend.id, "No matching IDs for backend");
        return TaskOutcome::Skip;
    };

    let method = request
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    tracing::debug!(trace_id, backend_id = backend.id, url = backend.url, "Sending to backend");
    inner
        .metrics
        .incr("backend.requests", &[("server", &backend.name)]);

    let started = Instant::now();
    let sent = inner
        .client
        .send(&backend.url, backend.ignore_tls, &server_request)
        .await;
    inner.pool.put(server_request);

    match sent {
        Err(e) => {
            inner.breakers.report_failure(&backend.name);
            inner.metrics.incr(
                "backend.request_status",
                &[("server", &backend.url), ("status", "error")],
            );
            tracing::error!(trace_id, url = backend.url, error = %e, "Backend request failed");
            TaskOutcome::Error(format!("{}: {}", backend.url, e))
        }
        Ok(mut envelope) => {
            inner.breakers.report_success(&backend.name);
            inner.metrics.incr(
                "backend.request_status",
                &[("server", &backend.url), ("status", "success")],
            );
            inner.metrics.timing(
                "backend.request_duration",
                started.elapsed(),
                &[("server", &backend.url), ("method", method)],
            );
            tracing::debug!(
                trace_id,
                backend_id = backend.id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Response from backend"
            );

            match envelope.remove("result") {
                Some(result) => {
                    let rewriter = ResponseRewriter::new(
                        backend.id,
                        Arc::clone(&inner.cache),
                        Arc::clone(&inner.dedup_types),
                        seen,
                    );
                    TaskOutcome::Result(rewriter.rewrite(result))
                }
                None => TaskOutcome::Skip,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;
    use crate::errors::ProxyError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted backend: URL → response envelope, with optional latency and
    /// a high-water mark of concurrent sends.
    struct MockClient {
        responses: HashMap<String, Value>,
        delay: Duration,
        concurrent: AtomicUsize,
        max_concurrent: AtomicUsize,
    }

    impl MockClient {
        fn new(responses: HashMap<String, Value>) -> Self {
            MockClient {
                responses,
                delay: Duration::ZERO,
                concurrent: AtomicUsize::new(0),
                max_concurrent: AtomicUsize::new(0),
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[async_trait]
    impl BackendClient for MockClient {
        async fn send(
            &self,
            url: &str,
            _ignore_tls: bool,
            _request: &JsonMap,
        ) -> Result<JsonMap, ProxyError> {
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.concurrent.fetch_sub(1, Ordering::SeqCst);

            match self.responses.get(url) {
                Some(envelope) => Ok(envelope.as_object().unwrap().clone()),
                None => Err(ProxyError::UpstreamSend("connection refused".to_string())),
            }
        }
    }

    fn backend(id: u8) -> Backend {
        Backend {
            id,
            name: format!("zbx{id}"),
            url: format!("http://zbx{id}.example.com"),
            token: format!("token-{id}"),
            ignore_tls: false,
        }
    }

    fn engine_with(
        backends: Vec<Backend>,
        client: Arc<dyn BackendClient>,
        cache: Arc<TranslationCache>,
        max_requests: usize,
        max_timeout: Duration,
    ) -> FanoutEngine {
        let names = backends.iter().map(|b| b.name.clone()).collect::<Vec<_>>();
        FanoutEngine::new(
            backends,
            max_requests,
            max_timeout,
            vec!["group".to_string()],
            BreakerManager::new(names, BreakerConfig::default()),
            client,
            cache,
            Metrics::noop(),
        )
    }

    fn plain_cache() -> Arc<TranslationCache> {
        Arc::new(TranslationCache::in_memory(HashMap::new()))
    }

    fn host_get(params: Value) -> Arc<JsonMap> {
        Arc::new(
            json!({"jsonrpc": "2.0", "method": "host.get", "id": 1, "params": params})
                .as_object()
                .unwrap()
                .clone(),
        )
    }

    #[tokio::test]
    async fn id_based_request_splits_and_merges() {
        let client = Arc::new(MockClient::new(HashMap::from([
            (
                "http://zbx1.example.com".to_string(),
                json!({"jsonrpc": "2.0", "result": [{"hostid": "1000", "name": "h1"}], "id": 1}),
            ),
            (
                "http://zbx2.example.com".to_string(),
                json!({"jsonrpc": "2.0", "result": [{"hostid": "2000", "name": "h2"}], "id": 1}),
            ),
        ])));
        let engine = engine_with(
            vec![backend(1), backend(2)],
            client,
            plain_cache(),
            10,
            Duration::from_secs(5),
        );

        let (result, errors) = engine
            .execute(host_get(json!({"hostids": ["10001", "20001"]})), "t1")
            .await;

        assert!(errors.is_empty());
        let mut hosts: Vec<String> = result
            .as_array()
            .unwrap()
            .iter()
            .map(|h| h["hostid"].as_str().unwrap().to_string())
            .collect();
        hosts.sort();
        assert_eq!(hosts, vec!["10001", "20001"]);
    }

    #[tokio::test]
    async fn hash_dedup_collapses_same_named_groups() {
        let client = Arc::new(MockClient::new(HashMap::from([
            (
                "http://zbx1.example.com".to_string(),
                json!({"jsonrpc": "2.0", "result": [{"groupid": "1", "name": "Linux"}], "id": 1}),
            ),
            (
                "http://zbx2.example.com".to_string(),
                json!({"jsonrpc": "2.0", "result": [{"groupid": "7", "name": "Linux"}], "id": 1}),
            ),
        ])));
        let cache = Arc::new(TranslationCache::in_memory(HashMap::from([(
            "group".to_string(),
            "name".to_string(),
        )])));
        let engine = engine_with(
            vec![backend(1), backend(2)],
            client,
            cache.clone(),
            10,
            Duration::from_secs(5),
        );

        let (result, errors) = engine.execute(host_get(json!({})), "t2").await;

        assert!(errors.is_empty());
        let groups = result.as_array().unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0]["groupid"], json!("89539170"));

        // Both backend-native IDs now resolve through the cache.
        assert_eq!(cache.get_original_id("group", 89539170, 1), Some(1));
        assert_eq!(cache.get_original_id("group", 89539170, 2), Some(7));
    }

    #[tokio::test]
    async fn open_breaker_short_circuits_one_backend() {
        let client = Arc::new(MockClient::new(HashMap::from([(
            "http://zbx2.example.com".to_string(),
            json!({"jsonrpc": "2.0", "result": [{"itemid": "5"}], "id": 1}),
        )])));
        let names = vec!["zbx1".to_string(), "zbx2".to_string()];
        let breakers = BreakerManager::new(
            names,
            BreakerConfig {
                failure_threshold: 1,
                ..BreakerConfig::default()
            },
        );
        breakers.report_failure("zbx1");

        let engine = FanoutEngine::new(
            vec![backend(1), backend(2)],
            10,
            Duration::from_secs(5),
            vec![],
            breakers,
            client,
            plain_cache(),
            Metrics::noop(),
        );

        let (result, errors) = engine.execute(host_get(json!({})), "t3").await;

        // Backend 2's data comes back; the error list is discarded by the
        // gate on partial success, but the engine still reports it.
        assert_eq!(result.as_array().unwrap().len(), 1);
        assert_eq!(errors, vec!["server 1: circuit breaker open".to_string()]);
    }

    #[tokio::test]
    async fn all_failures_surface_every_error() {
        let client = Arc::new(MockClient::new(HashMap::new()));
        let engine = engine_with(
            vec![backend(1), backend(2)],
            client,
            plain_cache(),
            10,
            Duration::from_secs(5),
        );

        let (result, mut errors) = engine.execute(host_get(json!({})), "t4").await;

        assert!(result.is_null());
        errors.sort();
        assert_eq!(
            errors,
            vec![
                "http://zbx1.example.com: request failed: connection refused".to_string(),
                "http://zbx2.example.com: request failed: connection refused".to_string(),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_returns_the_timeout_error() {
        let client = Arc::new(
            MockClient::new(HashMap::from([(
                "http://zbx1.example.com".to_string(),
                json!({"jsonrpc": "2.0", "result": [{"itemid": "5"}], "id": 1}),
            )]))
            .with_delay(Duration::from_secs(2)),
        );
        let engine = engine_with(
            vec![backend(1)],
            client,
            plain_cache(),
            10,
            Duration::from_millis(100),
        );

        let (result, errors) = engine.execute(host_get(json!({})), "t5").await;

        assert!(result.is_null());
        assert_eq!(errors, vec![TIMEOUT_ERROR.to_string()]);
    }

    #[tokio::test]
    async fn planning_error_when_no_backend_owns_the_ids() {
        let client = Arc::new(MockClient::new(HashMap::new()));
        let engine = engine_with(
            vec![backend(1)],
            client,
            plain_cache(),
            10,
            Duration::from_secs(5),
        );

        let (result, errors) = engine
            .execute(host_get(json!({"hostids": ["10007"]})), "t6")
            .await;

        assert!(result.is_null());
        assert_eq!(errors, vec![NO_TARGETS_ERROR.to_string()]);
    }

    #[tokio::test]
    async fn semaphore_bounds_concurrent_outbound_requests() {
        let responses: HashMap<String, Value> = (1u8..=6)
            .map(|id| {
                (
                    format!("http://zbx{id}.example.com"),
                    json!({"jsonrpc": "2.0", "result": [], "id": 1}),
                )
            })
            .collect();
        let client =
            Arc::new(MockClient::new(responses).with_delay(Duration::from_millis(20)));
        let backends: Vec<Backend> = (1u8..=6).map(backend).collect();
        let engine = engine_with(
            backends,
            client.clone(),
            plain_cache(),
            2,
            Duration::from_secs(5),
        );

        let (_result, errors) = engine.execute(host_get(json!({})), "t7").await;

        assert!(errors.is_empty());
        assert!(client.max_concurrent.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn map_results_merge_key_wise() {
        let client = Arc::new(MockClient::new(HashMap::from([
            (
                "http://zbx1.example.com".to_string(),
                json!({"jsonrpc": "2.0", "result": {"100": {"eventid": "9"}}, "id": 1}),
            ),
            (
                "http://zbx2.example.com".to_string(),
                json!({"jsonrpc": "2.0", "result": {"200": {"eventid": "8"}}, "id": 1}),
            ),
        ])));
        let engine = engine_with(
            vec![backend(1), backend(2)],
            client,
            plain_cache(),
            10,
            Duration::from_secs(5),
        );

        let (result, errors) = engine.execute(host_get(json!({})), "t8").await;

        assert!(errors.is_empty());
        let map = result.as_object().unwrap();
        assert_eq!(map.len(), 2);
        assert!(map.contains_key("1001"));
        assert!(map.contains_key("2002"));
    }

    #[tokio::test]
    async fn empty_results_with_no_errors_stay_empty() {
        let client = Arc::new(MockClient::new(HashMap::from([(
            "http://zbx1.example.com".to_string(),
            json!({"jsonrpc": "2.0", "result": [], "id": 1}),
        )])));
        let engine = engine_with(
            vec![backend(1)],
            client,
            plain_cache(),
            10,
            Duration::from_secs(5),
        );

        let (result, errors) = engine.execute(host_get(json!({})), "t9").await;
        assert!(result.is_null());
        assert!(errors.is_empty());
    }
}
