use thiserror::Error;

/// Result type alias for aggregator operations
pub type Result<T, E = ProxyError> = std::result::Result<T, E>;

/// Errors that can occur while gating, fanning out, or aggregating requests
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("failed to read request body: {0}")]
    RequestBody(String),

    #[error("HTTP {status}: {body}")]
    UpstreamStatus { status: u16, body: String },

    #[error("request failed: {0}")]
    UpstreamSend(String),

    #[error("response body exceeds {limit} bytes")]
    UpstreamBodyTooLarge { limit: usize },

    #[error("invalid JSON response: {0}")]
    UpstreamInvalidJson(String),

    /// The backend answered with a JSON-RPC `error` member.
    #[error("{0}")]
    UpstreamRpcError(String),

    #[error("response serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
