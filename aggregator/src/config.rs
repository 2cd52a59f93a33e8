use std::time::Duration;

/// One upstream backend, fixed for the lifetime of a `ProxyCore`.
///
/// `id` is the single decimal digit carried in proxy IDs, so it must be in
/// `[1,9]` and distinct across the fleet; the binary validates this at load
/// time.
#[derive(Clone, Debug)]
pub struct Backend {
    pub id: u8,
    /// Display name, defaulted from the URL host when not configured.
    pub name: String,
    pub url: String,
    /// API token presented to this backend as the JSON-RPC `auth` field.
    pub token: String,
    /// Skip TLS certificate verification for this backend.
    pub ignore_tls: bool,
}

/// Global gate/fan-out settings, parsed from the `global` config section.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Bearer token required on inbound requests, when set.
    pub token: Option<String>,
    /// Basic-auth credentials required on inbound requests, when set and no
    /// bearer token is configured.
    pub login: Option<String>,
    pub password: Option<String>,
    /// Inbound body cap in bytes.
    pub max_body_bytes: usize,
    /// End-to-end deadline for one fan-out.
    pub max_timeout: Duration,
    /// Listener cap on reading one request's headers.
    pub read_timeout: Duration,
    /// Listener progress deadline for socket writes.
    pub write_timeout: Duration,
    /// Listener deadline for idle/slow-reading connections.
    pub idle_timeout: Duration,
    /// Process-wide cap on concurrent outbound requests.
    pub max_requests: usize,
    /// Unauthenticated stats route; empty disables it.
    pub metric_path: Option<String>,
    /// Version string answered to `apiinfo.version`.
    pub api_version: String,
    /// Methods whose request/response bodies are kept out of debug logs.
    pub exclude_methods: Vec<String>,
    /// Entity types deduplicated in aggregated top-level sequences.
    pub dedup_types: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            token: None,
            login: None,
            password: None,
            max_body_bytes: 15 * 1024 * 1024,
            max_timeout: Duration::from_secs(31),
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(15),
            max_requests: 100,
            metric_path: None,
            api_version: "6.4".to_string(),
            exclude_methods: Vec::new(),
            dedup_types: vec!["group".to_string()],
        }
    }
}

/// Limits applied to the outbound `BackendClient`.
#[derive(Clone, Debug)]
pub struct OutboundLimits {
    /// Per-attempt timeout for one backend request.
    pub request_timeout: Duration,
    /// Cap on a backend response body, in bytes.
    pub max_response_bytes: usize,
}

impl Default for OutboundLimits {
    fn default() -> Self {
        OutboundLimits {
            request_timeout: Duration::from_secs(20),
            max_response_bytes: 20 * 1024 * 1024,
        }
    }
}

/// Derives a display name from the backend URL host, like the dashboards do.
pub fn backend_name_from_url(url: &str) -> Option<String> {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_name_is_the_url_host() {
        assert_eq!(
            backend_name_from_url("https://zbx1.example.com/api_jsonrpc.php"),
            Some("zbx1.example.com".to_string())
        );
        assert_eq!(backend_name_from_url("not a url"), None);
    }
}
