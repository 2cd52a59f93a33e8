use crate::io::TimeoutStream;
use http_body_util::Full;
use hyper::StatusCode;
use hyper::body::{Body, Bytes, Incoming};
use hyper::service::Service;
use hyper::{Request, Response};
use hyper_util::rt::TokioExecutor;
use hyper_util::rt::TokioIo;
use hyper_util::rt::TokioTimer;
use hyper_util::server::conn::auto::Builder;
use hyper_util::server::graceful::GracefulShutdown;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Inbound listener timeouts. A zero duration disables that protection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ServerTimeouts {
    /// Cap on reading one request's headers.
    pub read: Duration,
    /// Progress deadline for socket writes.
    pub write: Duration,
    /// Progress deadline for socket reads; also reaps idle keep-alive
    /// connections waiting for their next request.
    pub idle: Duration,
}

impl Default for ServerTimeouts {
    fn default() -> Self {
        ServerTimeouts {
            read: Duration::from_secs(10),
            write: Duration::from_secs(10),
            idle: Duration::from_secs(15),
        }
    }
}

/// Accepts connections and hands them to hyper until `shutdown` fires, then
/// drains in-flight connections for at most `drain`.
///
/// Each connection auto-detects h1/h2 on the socket and picks up the
/// current `timeouts` value when accepted, so a config reload applies to
/// every connection from then on.
pub async fn run_http_service<S, B, E>(
    listen_addr: &str,
    service: S,
    timeouts: watch::Receiver<ServerTimeouts>,
    mut shutdown: watch::Receiver<bool>,
    drain: Duration,
) -> Result<(), E>
where
    S: Service<Request<Incoming>, Response = Response<B>, Error = E> + Send + Sync + 'static,
    S::Future: Send + 'static,
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: std::error::Error + Send + Sync,
    E: From<std::io::Error> + std::error::Error + Send + Sync + 'static,
{
    let listener = TcpListener::bind(normalize_listen_addr(listen_addr)).await?;
    let service_arc = Arc::new(service);
    let graceful = GracefulShutdown::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _peer_addr) = accepted?;
                let _ = stream.set_nodelay(true);
                let limits = *timeouts.borrow();
                let io = TokioIo::new(TimeoutStream::new(stream, limits.idle, limits.write));
                let svc = service_arc.clone();

                let mut server = Builder::new(TokioExecutor::new());
                if !limits.read.is_zero() {
                    server
                        .http1()
                        .timer(TokioTimer::new())
                        .header_read_timeout(limits.read);
                }
                let conn = server.serve_connection(io, svc);
                let watched = graceful.watch(conn.into_owned());
                tokio::spawn(async move {
                    let _ = watched.await;
                });
            }
            _ = shutdown.changed() => {
                break;
            }
        }
    }

    tracing::info!("Listener stopped, draining connections");
    tokio::select! {
        _ = graceful.shutdown() => {}
        _ = tokio::time::sleep(drain) => {
            tracing::warn!("Drain deadline reached with connections still open");
        }
    }
    Ok(())
}

/// A bare `":8080"` listen address binds every interface.
fn normalize_listen_addr(addr: &str) -> String {
    if let Some(port) = addr.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        addr.to_string()
    }
}

/// Plain-text response carrying the status' canonical reason.
pub fn make_error_response(status_code: StatusCode) -> Response<Full<Bytes>> {
    let message = status_code
        .canonical_reason()
        .unwrap_or("an error occurred");

    let mut response = Response::new(Full::new(Bytes::from(message)));
    *response.status_mut() = status_code;
    response
}

/// `application/json` response from pre-serialized bytes.
pub fn make_json_response(status_code: StatusCode, body: Vec<u8>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status_code;
    response.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/json"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_response_uses_canonical_reason() {
        let response = make_error_response(StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[test]
    fn json_response_sets_content_type() {
        let body = serde_json::to_vec(&serde_json::json!({"status": "OK"})).unwrap();
        let response = make_json_response(StatusCode::OK, body);
        assert_eq!(
            response.headers().get(http::header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }

    #[test]
    fn listen_addr_without_host_binds_all_interfaces() {
        assert_eq!(normalize_listen_addr(":8080"), "0.0.0.0:8080");
        assert_eq!(normalize_listen_addr("127.0.0.1:9000"), "127.0.0.1:9000");
    }

    #[test]
    fn default_timeouts_match_the_documented_values() {
        let timeouts = ServerTimeouts::default();
        assert_eq!(timeouts.read, Duration::from_secs(10));
        assert_eq!(timeouts.write, Duration::from_secs(10));
        assert_eq!(timeouts.idle, Duration::from_secs(15));
    }
}
