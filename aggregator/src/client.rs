use crate::config::OutboundLimits;
use crate::errors::ProxyError;
use crate::pool::JsonMap;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;

const ERROR_BODY_PREVIEW: usize = 1024;

/// Outbound transport seam. The fan-out engine only ever talks to backends
/// through this trait, so tests can swap in a scripted implementation.
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// POSTs a JSON-RPC request and returns the decoded response envelope.
    ///
    /// Cancellation propagates by dropping the returned future.
    async fn send(
        &self,
        url: &str,
        ignore_tls: bool,
        request: &JsonMap,
    ) -> Result<JsonMap, ProxyError>;

    /// Number of distinct HTTP clients currently allocated.
    fn clients_count(&self) -> usize {
        0
    }
}

/// reqwest-backed client. One shared client per TLS-verification mode,
/// allocated lazily under a double-checked lock.
pub struct HttpBackendClient {
    clients: RwLock<HashMap<bool, reqwest::Client>>,
    limits: OutboundLimits,
}

impl HttpBackendClient {
    pub fn new(limits: OutboundLimits) -> Self {
        HttpBackendClient {
            clients: RwLock::new(HashMap::new()),
            limits,
        }
    }

    fn client_for(&self, ignore_tls: bool) -> Result<reqwest::Client, ProxyError> {
        if let Some(client) = self.clients.read().get(&ignore_tls) {
            return Ok(client.clone());
        }

        let mut clients = self.clients.write();
        // Another task may have built the client while we waited.
        if let Some(client) = clients.get(&ignore_tls) {
            return Ok(client.clone());
        }

        let client = reqwest::Client::builder()
            .timeout(self.limits.request_timeout)
            .danger_accept_invalid_certs(ignore_tls)
            .build()
            .map_err(|e| ProxyError::Internal(format!("failed to build HTTP client: {e}")))?;
        clients.insert(ignore_tls, client.clone());
        Ok(client)
    }
}

#[async_trait]
impl BackendClient for HttpBackendClient {
    async fn send(
        &self,
        url: &str,
        ignore_tls: bool,
        request: &JsonMap,
    ) -> Result<JsonMap, ProxyError> {
        let client = self.client_for(ignore_tls)?;

        let response = client
            .post(url)
            .json(request)
            .send()
            .await
            .map_err(|e| ProxyError::UpstreamSend(e.to_string()))?;

        let status = response.status();
        if status.as_u16() >= 400 {
            let body = response.bytes().await.unwrap_or_default();
            let preview = String::from_utf8_lossy(&body[..body.len().min(ERROR_BODY_PREVIEW)]);
            return Err(ProxyError::UpstreamStatus {
                status: status.as_u16(),
                body: preview.into_owned(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| ProxyError::UpstreamSend(e.to_string()))?;
        if body.len() > self.limits.max_response_bytes {
            return Err(ProxyError::UpstreamBodyTooLarge {
                limit: self.limits.max_response_bytes,
            });
        }

        let envelope: Value = serde_json::from_slice(&body).map_err(|e| {
            let preview = String::from_utf8_lossy(&body[..body.len().min(100)]);
            tracing::warn!(url, preview = %preview, "Invalid JSON response");
            ProxyError::UpstreamInvalidJson(e.to_string())
        })?;

        let Value::Object(envelope) = envelope else {
            return Err(ProxyError::UpstreamInvalidJson(
                "response is not a JSON object".to_string(),
            ));
        };

        if let Some(error) = envelope.get("error") {
            return Err(ProxyError::UpstreamRpcError(error.to_string()));
        }

        Ok(envelope)
    }

    fn clients_count(&self) -> usize {
        self.clients.read().len()
    }
}
