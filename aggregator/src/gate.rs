//! HTTP-facing request gate.
//!
//! Validates the transaction shape (method, content type, body size,
//! JSON-RPC envelope), answers the distinguished short-circuit methods,
//! authenticates, and only then hands the parsed request to the fan-out
//! engine. Body bytes are read exactly once.

use crate::core::ProxyCore;
use crate::errors::ProxyError;
use crate::pool::JsonMap;
use base64::Engine as _;
use http::header::{AUTHORIZATION, CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE, WWW_AUTHENTICATE};
use http::{HeaderValue, Method, StatusCode};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Bytes};
use hyper::service::Service;
use hyper::{Request, Response};
use parking_lot::RwLock;
use serde_json::{Value, json};
use shared::http::{make_error_response, make_json_response};
use shared::metrics::Metrics;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

pub const SERVICE_NAME: &str = "Zabbix API Proxy";

/// Back-compat stub for clients that insist on a login step.
const LOGIN_TOKEN: &str = "faketoken123";

/// 16x16 PNG answered to browsers so their probes stay out of the logs.
const FAVICON_B64: &str = "iVBORw0KGgoAAAANSUhEUgAAACAAAAAgCAYAAABzenr0AAAEa0lEQVR4AbxXS0xUVxj+7u0IM7xmhOHhC4gJuoAFoUq0CzUsrJG4aPBFG6NpN8aFC23irgtWmtSN67bGReMrisa4IPERFlat0GgsG7uQBFqE8hihZZgHc/t9Z+6MjAxCEZj83z3n/P/5v/+b87iZsbHAj3PggJ/4kviB6CKGibgL9eVTTHP8C6TFvAKcQ4c2OQcP/kjCAeJn4hviU6KE+MSF+vIppjkDylEu4x+0OQU4+/blkeR7OM7vxNdk8RELNZ/JYa44xDVXYlYBTktLDbzeX0lymlg1V/K8fsdZxfzT4jKcWRJmCeCyNcC2f+HcWmKprFachvs9xgwBRmUi0cE5QWKpLQhymxozmNMCzD7Zdjtjy1GctMaCXIl2U8sMMeMW+Hxt9C3lspMuq9UiWcsEzQpwbzZxdJJYKTvp1nRXwHHO8LQu/rT/X9nJ23FGaTbfZH4Wb9VgReE4raqtLWieaGjwjezdixSiZWWIrF+fHss/nZ9v9CVyczG+dStG9+xBZN06TFVWmv7Eli1I5OSYOdGKioxc8U3W1GB09278U1+fmqcXW7MENE00NuLtjh0GPKWwYzG8OXbMjFP+hNcLx+PBnydOYLilBaFduxAtLYWKqf/3/v346/hxOLaNWElJRm68uBiRqiqEmpowdPgw+k+dQow+qm2SgHorHmcfKOzqwup79/Dm6FFMFxQYX+phTU9jqroasfLylGtWG127FpENG2b533fEAwGMcTXor5eA6ty+PuS/fIngrVsYam0134rBtHlfv4YnFEJqG9KBLJ2FzFGatphttQQE9K3LrlzBSHMzJjdvpv+dqbBi7zzz9CxrngnJsLvqAQmAlnd82zaMb9+ejLpPe3ISFRcvmrjrWrKm4MULwyUBofDGjebbG4/7sKJRVFy6hHhREfp4aHQA3dBHNXYkgsDDh/B3doonJAG9oZ07odMvj0EigfLLl8H3AwaPHEEiLw9xv9+EFvvwP3qEyrNnUdXWhuKODlisQa5eCXie8OlKcihzHJTevAnP6Ki5io57txX6GNjhsDnI2u4ZPM8l4EF+Tw8Knz41CLJ4YXc3/q2rMzdD/qInT+AZH8eqkREzRz5B45yhoQyfhAtFjx8jBc/Y2IyaGd0HEnA30NkZLm1vh1D07JlZ+tX375uxfLqeFl9Ouf39aZ/8Xl5fb29vhi93YABC8PZtpJAzOJhR1R2E2d61revX38KyuOEcrqSxpmprBUAB54gYVupjWTHWO6dyRoB19eorDi4QK2UX3Jru7wGVDYe/Y9NDLLf1IFnL1DEroJ51584kfzR+wf4wsVw2rBqmllshLUBj68aNP/hC+pz95RAxLG5TgwVSliFATu7Nb1T5GftLuR094jTcJJ5pswQoaFROTTXypJ4nYvItCsnTfh7kMpxZSLIK0Dztk3Xt2rcUUEf8RJ9eHGwWZGGTY1l14hDXXFlzCkglcNlekUT/etfQ9xWhf8rdbEeIaRfqy6eY5qxRjnIZ/6D9BwAA//8TDJApAAAABklEQVQDAAnO3K5MuJtSAAAAAElFTkSuQmCC";

/// Handle the gate shares with the reload path: the inner `Arc` is swapped
/// atomically when a new configuration generation comes up.
pub type SharedCore = Arc<RwLock<Arc<ProxyCore>>>;

pub fn shared_core(core: ProxyCore) -> SharedCore {
    Arc::new(RwLock::new(Arc::new(core)))
}

#[derive(Clone)]
pub struct GateService {
    core: SharedCore,
    metrics: Metrics,
    version: String,
}

impl GateService {
    pub fn new(core: SharedCore, metrics: Metrics, version: &str) -> Self {
        GateService {
            core,
            metrics,
            version: version.to_string(),
        }
    }
}

impl<B> Service<Request<B>> for GateService
where
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    type Response = Response<Full<Bytes>>;
    type Error = ProxyError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<B>) -> Self::Future {
        let core = self.core.read().clone();
        let metrics = self.metrics.clone();
        let version = self.version.clone();

        Box::pin(async move { handle(core, metrics, version, req).await })
    }
}

async fn handle<B>(
    core: Arc<ProxyCore>,
    metrics: Metrics,
    version: String,
    req: Request<B>,
) -> Result<Response<Full<Bytes>>, ProxyError>
where
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let started = Instant::now();
    metrics.incr("gate.requests", &[]);

    let path = req.uri().path().to_string();
    let method = req.method().clone();

    if path == "/favicon.ico" {
        return Ok(favicon_response());
    }
    // The stats and health surfaces stay unauthenticated.
    if core.settings.metric_path.as_deref() == Some(path.as_str()) {
        return stats_response(&core, &version);
    }
    if path == "/health" {
        return health_response(&version);
    }

    let trace_id = Uuid::new_v4().to_string();
    tracing::debug!(trace_id, method = %method, path, "Incoming request");

    if method == Method::GET && path == "/" {
        return rpc_response(&json!({"jsonrpc": "2.0", "result": SERVICE_NAME, "id": 1}));
    }
    if method != Method::POST {
        tracing::warn!(trace_id, method = %method, "Unsupported method");
        return Ok(make_error_response(StatusCode::METHOD_NOT_ALLOWED));
    }

    let content_type = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !content_type.contains("application/json") {
        tracing::error!(trace_id, content_type, "Invalid content type");
        return Ok(make_error_response(StatusCode::UNSUPPORTED_MEDIA_TYPE));
    }

    let max_body = core.settings.max_body_bytes;
    if let Some(declared) = req
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok())
        && declared > max_body
    {
        tracing::error!(trace_id, declared, "Request body too large");
        return Ok(make_error_response(StatusCode::PAYLOAD_TOO_LARGE));
    }

    let authorization = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    // Read the body exactly once, bounded by the configured cap.
    let body = match Limited::new(req.into_body(), max_body).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            let status = if e.is::<LengthLimitError>() {
                StatusCode::PAYLOAD_TOO_LARGE
            } else {
                StatusCode::BAD_REQUEST
            };
            tracing::error!(trace_id, error = %e, "Error reading body");
            return Ok(make_error_response(status));
        }
    };

    let request: JsonMap = match serde_json::from_slice::<Value>(&body) {
        Ok(Value::Object(map)) => map,
        Ok(_) | Err(_) => {
            tracing::error!(trace_id, "Error parsing JSON");
            return Ok(make_error_response(StatusCode::BAD_REQUEST));
        }
    };

    if request.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        tracing::error!(trace_id, "Invalid JSON-RPC version");
        return Ok(make_error_response(StatusCode::BAD_REQUEST));
    }

    let Some(rpc_method) = request.get("method").and_then(Value::as_str).map(str::to_string)
    else {
        tracing::error!(trace_id, "Method not specified");
        return Ok(make_error_response(StatusCode::BAD_REQUEST));
    };
    let request_id = request.get("id").cloned().unwrap_or(Value::Null);

    let loggable = !core.settings.exclude_methods.iter().any(|m| m == &rpc_method);
    if loggable {
        tracing::debug!(trace_id, request = %masked_json(&request), "Request");
    }
    tracing::info!(trace_id, method = rpc_method, "Processing");

    // Short-circuit methods never reach the fan-out engine.
    if rpc_method.ends_with(".create") {
        tracing::debug!(trace_id, method = rpc_method, "Blocking create method");
        return rpc_response(&json!({
            "jsonrpc": "2.0",
            "error": {
                "code": -1,
                "message": "Invalid method.",
                "data": "Create methods are not implemented in proxy.",
            },
            "id": request_id,
        }));
    }
    if rpc_method == "user.login" {
        return rpc_response(&json!({"jsonrpc": "2.0", "result": LOGIN_TOKEN, "id": request_id}));
    }
    if rpc_method == "apiinfo.version" {
        return rpc_response(&json!({
            "jsonrpc": "2.0",
            "result": core.settings.api_version,
            "id": request_id,
        }));
    }

    if let Some(token) = &core.settings.token {
        let expected = format!("Bearer {token}");
        if authorization.as_deref() != Some(expected.as_str()) {
            tracing::error!(trace_id, "Invalid token");
            return Ok(make_error_response(StatusCode::UNAUTHORIZED));
        }
    } else if let (Some(login), Some(password)) = (&core.settings.login, &core.settings.password)
        && !basic_auth_matches(authorization.as_deref(), login, password)
    {
        tracing::error!(trace_id, "Invalid credentials");
        let mut response = make_error_response(StatusCode::UNAUTHORIZED);
        response.headers_mut().insert(
            WWW_AUTHENTICATE,
            HeaderValue::from_static("Basic realm=\"Restricted\""),
        );
        return Ok(response);
    }

    if !core.has_backends() {
        tracing::error!(trace_id, "No backends configured");
        return Ok(make_error_response(StatusCode::INTERNAL_SERVER_ERROR));
    }

    let (results, errors) = core.engine.execute(Arc::new(request), &trace_id).await;

    let status = if errors.is_empty() {
        "success"
    } else if results.is_null() {
        "error"
    } else {
        // Partial success: the result is authoritative, the error list is
        // dropped from the envelope.
        "halfError"
    };

    let envelope = if results.is_null() && !errors.is_empty() {
        tracing::error!(trace_id, ?errors, "All backend requests failed");
        json!({"jsonrpc": "2.0", "error": errors, "id": request_id})
    } else {
        let results = if results.is_null() { json!([]) } else { results };
        json!({"jsonrpc": "2.0", "result": results, "id": request_id})
    };

    let body = match serde_json::to_vec(&envelope) {
        Ok(body) => body,
        Err(e) => {
            tracing::error!(trace_id, error = %e, "Error marshaling response");
            return Ok(make_error_response(StatusCode::INTERNAL_SERVER_ERROR));
        }
    };

    if loggable {
        tracing::debug!(trace_id, response = %masked_json_value(&envelope), "Response");
    }

    metrics.incr("gate.requests_total", &[("method", &rpc_method), ("status", status)]);
    metrics.incr("gate.requests_total", &[("method", "all"), ("status", status)]);
    metrics.gauge("gate.response_bytes", body.len() as u64, &[]);
    metrics.timing(
        "gate.request_duration",
        started.elapsed(),
        &[("method", &rpc_method)],
    );
    tracing::info!(trace_id, status, elapsed_ms = started.elapsed().as_millis() as u64, "Completed");

    Ok(make_json_response(StatusCode::OK, body))
}

fn rpc_response(envelope: &Value) -> Result<Response<Full<Bytes>>, ProxyError> {
    let body = serde_json::to_vec(envelope)?;
    Ok(make_json_response(StatusCode::OK, body))
}

fn health_response(version: &str) -> Result<Response<Full<Bytes>>, ProxyError> {
    let body = serde_json::to_vec(&json!({"status": "OK", "version": version}))?;
    Ok(make_json_response(StatusCode::OK, body))
}

fn stats_response(core: &ProxyCore, version: &str) -> Result<Response<Full<Bytes>>, ProxyError> {
    let mut stats = core.stats();
    stats["version"] = json!(version);
    let body = serde_json::to_vec(&stats)?;
    Ok(make_json_response(StatusCode::OK, body))
}

fn favicon_response() -> Response<Full<Bytes>> {
    let icon = base64::engine::general_purpose::STANDARD
        .decode(FAVICON_B64)
        .unwrap_or_default();
    let mut response = Response::new(Full::new(Bytes::from(icon)));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("image/x-icon"));
    response.headers_mut().insert(
        CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=86400"),
    );
    response
}

fn basic_auth_matches(header: Option<&str>, login: &str, password: &str) -> bool {
    let Some(encoded) = header.and_then(|h| h.strip_prefix("Basic ")) else {
        return false;
    };
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
        return false;
    };
    let Ok(credentials) = String::from_utf8(decoded) else {
        return false;
    };
    match credentials.split_once(':') {
        Some((got_login, got_password)) => got_login == login && got_password == password,
        None => false,
    }
}

/// Keeps the first and last 3 characters of long tokens; shorter ones are
/// fully starred.
fn mask_auth(auth: &str) -> String {
    let chars: Vec<char> = auth.chars().collect();
    if chars.len() <= 10 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..3].iter().collect();
    let tail: String = chars[chars.len() - 3..].iter().collect();
    format!("{head}{}{tail}", "*".repeat(chars.len() - 6))
}

fn masked_json(map: &JsonMap) -> String {
    masked_json_value(&Value::Object(map.clone()))
}

fn masked_json_value(value: &Value) -> String {
    let mut value = value.clone();
    if let Value::Object(map) = &mut value
        && let Some(Value::String(auth)) = map.get("auth")
    {
        let masked = mask_auth(auth);
        map.insert("auth".to_string(), Value::String(masked));
    }
    serde_json::to_string_pretty(&value).unwrap_or_default()
}
