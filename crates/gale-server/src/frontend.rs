//! Public HTTP front-end.
//!
//! Every inbound request is routed by its `Host` header: `<label>.<zone>`
//! goes through the matching tunnel, anything else gets the status page.
//! The handler buffers the request body, rewrites hop-by-hop headers, and
//! waits on the session's pending slot for the tunneled response.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::body::{to_bytes, Body};
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use gale_core::config::ServerConfig;
use gale_proto::{is_hop_by_hop, Headers, ResponseEnvelope};

use crate::registry::TunnelRegistry;
use crate::session::{ForwardError, SessionHandle};
use crate::status;

/// Shared state for the front-end handlers.
#[derive(Clone)]
pub struct FrontendState {
    pub registry: TunnelRegistry,
    pub config: Arc<ServerConfig>,
    pub started_at: Instant,
    /// Whether this listener terminates TLS; drives `X-Forwarded-Proto`.
    pub tls: bool,
}

pub fn router(state: FrontendState) -> Router {
    Router::new().fallback(proxy_handler).with_state(state)
}

/// Serve the front-end over plaintext HTTP.
pub async fn serve_plain(
    listener: TcpListener,
    state: FrontendState,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
}

/// Serve the front-end over TLS: accept, handshake, then hand the stream to
/// hyper with the peer address injected for `ConnectInfo`.
pub async fn serve_tls(
    listener: TcpListener,
    state: FrontendState,
    acceptor: TlsAcceptor,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    use tower::util::ServiceExt;

    let app = router(state);
    loop {
        tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            accepted = listener.accept() => {
                let (tcp, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept HTTPS connection");
                        continue;
                    }
                };
                let acceptor = acceptor.clone();
                let app = app.clone();
                tokio::spawn(async move {
                    let tls_stream = match acceptor.accept(tcp).await {
                        Ok(stream) => stream,
                        Err(e) => {
                            debug!(peer = %peer, error = %e, "TLS handshake failed");
                            return;
                        }
                    };
                    let io = TokioIo::new(tls_stream);
                    let service = hyper::service::service_fn(
                        move |request: hyper::Request<hyper::body::Incoming>| {
                            let app = app.clone();
                            async move {
                                let (mut parts, body) = request.into_parts();
                                parts.extensions.insert(ConnectInfo(peer));
                                let request =
                                    axum::extract::Request::from_parts(parts, Body::new(body));
                                app.oneshot(request).await
                            }
                        },
                    );
                    let builder =
                        hyper_util::server::conn::auto::Builder::new(TokioExecutor::new());
                    if let Err(e) = builder.serve_connection(io, service).await {
                        debug!(peer = %peer, error = %e, "HTTPS connection error");
                    }
                });
            }
        }
    }
}

async fn proxy_handler(
    State(state): State<FrontendState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: axum::extract::Request,
) -> Response {
    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| request.uri().authority().map(|a| a.to_string()))
        .unwrap_or_default();

    let Some(label) = routing_key(&host, &state.config.zone) else {
        return status::status_page(&state).await;
    };

    let Some(session) = state.registry.lookup(&label).await else {
        debug!(host = %host, label = %label, "No tunnel for host");
        return error_response(
            StatusCode::BAD_GATEWAY,
            format!("no tunnel registered for {label}.{}", state.config.zone),
        );
    };

    let (parts, body) = request.into_parts();
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    // Reject bodies the Content-Length already shows to be oversized, before
    // reading anything.
    let declared_len = parts
        .headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<usize>().ok());
    if declared_len.is_some_and(|len| len > state.config.max_body_bytes) {
        return error_response(
            StatusCode::PAYLOAD_TOO_LARGE,
            format!("request body exceeds {} bytes", state.config.max_body_bytes),
        );
    }

    let mut headers = Headers::new();
    let mut forwarded_for: Vec<String> = Vec::new();
    for (name, value) in parts.headers.iter() {
        let Ok(value) = value.to_str() else {
            debug!(header = %name, "Dropping non-UTF-8 header value");
            continue;
        };
        if name.as_str().eq_ignore_ascii_case("x-forwarded-for") {
            forwarded_for.push(value.to_string());
            continue;
        }
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        headers.push(name.as_str(), value);
    }
    forwarded_for.push(peer.ip().to_string());
    headers.push("X-Forwarded-For", forwarded_for.join(", "));
    headers.push(
        "X-Forwarded-Proto",
        if state.tls { "https" } else { "http" },
    );

    let body = match to_bytes(body, state.config.max_body_bytes).await {
        Ok(bytes) => bytes.to_vec(),
        Err(_) => {
            return error_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                format!("request body exceeds {} bytes", state.config.max_body_bytes),
            );
        }
    };

    match session
        .forward(
            parts.method.to_string(),
            path,
            headers,
            body,
            state.config.request_timeout(),
        )
        .await
    {
        Ok(response) => build_response(response, &session),
        Err(ForwardError::Timeout) => {
            error_response(StatusCode::GATEWAY_TIMEOUT, "tunnel response timed out")
        }
        Err(ForwardError::SessionClosed) => error_response(
            StatusCode::BAD_GATEWAY,
            "tunnel closed while handling the request",
        ),
    }
}

fn build_response(envelope: ResponseEnvelope, session: &SessionHandle) -> Response {
    let status = StatusCode::from_u16(envelope.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);

    if let Some(header_map) = builder.headers_mut() {
        for (name, value) in envelope.headers.iter() {
            if is_hop_by_hop(name) || name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            let (Ok(name), Ok(value)) = (
                HeaderName::try_from(name),
                HeaderValue::try_from(value),
            ) else {
                debug!(header = %name, "Dropping invalid tunneled header");
                continue;
            };
            header_map.append(name, value);
        }
        if let Ok(client_id) = HeaderValue::try_from(session.client_id.as_str()) {
            header_map.insert(HeaderName::from_static("x-tunnel-client"), client_id);
        }
    }

    builder
        .body(Body::from(envelope.body))
        .unwrap_or_else(|_| error_response(StatusCode::BAD_GATEWAY, "malformed tunneled response"))
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    let mut body = message.into();
    body.push('\n');
    (
        status,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
        .into_response()
}

/// Extract the tunnel label from a Host header value.
///
/// Returns `None` (status page) for the apex zone itself and for any host
/// that is not a single label directly under the zone.
pub(crate) fn routing_key(host: &str, zone: &str) -> Option<String> {
    let host = normalize_host(host);
    let zone = zone.to_ascii_lowercase();
    if host == zone {
        return None;
    }
    let label = host.strip_suffix(&zone)?.strip_suffix('.')?;
    if label.is_empty() || label.contains('.') {
        return None;
    }
    Some(label.to_string())
}

/// Lowercase and strip any port suffix, leaving bare IPv6 literals intact.
fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let without_port = if let Some(rest) = host.strip_prefix('[') {
        rest.split(']').next().unwrap_or(rest)
    } else {
        match host.rsplit_once(':') {
            Some((name, port))
                if !name.contains(':') && port.chars().all(|c| c.is_ascii_digit()) =>
            {
                name
            }
            _ => host,
        }
    };
    without_port.to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_key_extracts_label() {
        assert_eq!(routing_key("p.example.com", "example.com").as_deref(), Some("p"));
        assert_eq!(
            routing_key("My-App.Example.COM:8080", "example.com").as_deref(),
            Some("my-app")
        );
        assert_eq!(routing_key("p.localhost:8080", "localhost").as_deref(), Some("p"));
    }

    #[test]
    fn apex_and_foreign_hosts_go_to_status() {
        assert_eq!(routing_key("example.com", "example.com"), None);
        assert_eq!(routing_key("example.com:443", "example.com"), None);
        assert_eq!(routing_key("other.org", "example.com"), None);
        assert_eq!(routing_key("127.0.0.1:8080", "localhost"), None);
        assert_eq!(routing_key("", "example.com"), None);
    }

    #[test]
    fn nested_labels_are_not_routed() {
        assert_eq!(routing_key("a.b.example.com", "example.com"), None);
        // A suffix match that is not on a label boundary must not route.
        assert_eq!(routing_key("notexample.com", "example.com"), None);
    }

    #[test]
    fn normalize_host_handles_ipv6() {
        assert_eq!(normalize_host("[::1]:8080"), "::1");
        assert_eq!(normalize_host("[::1]"), "::1");
        assert_eq!(normalize_host("::1"), "::1");
        assert_eq!(normalize_host("Example.COM:80"), "example.com");
        assert_eq!(normalize_host("example.com"), "example.com");
    }
}
