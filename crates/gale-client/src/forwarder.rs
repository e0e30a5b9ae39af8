//! Local HTTP forwarder.
//!
//! Performs the short-lived round-trip to the origin service for each
//! relayed request. The origin is never retried; any failure becomes a 502
//! response with the cause in `X-Tunnel-Error`.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::{debug, warn};

use gale_proto::{is_hop_by_hop, Headers, RequestEnvelope, ResponseEnvelope};

use crate::error::TunnelClientError;

pub struct LocalForwarder {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, thiserror::Error)]
enum ForwardFailure {
    #[error("invalid method {0:?}")]
    BadMethod(String),

    #[error("{0}")]
    Http(#[from] reqwest::Error),
}

impl LocalForwarder {
    pub fn new(
        local_host: &str,
        local_port: u16,
        request_timeout: Duration,
    ) -> Result<Self, TunnelClientError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| TunnelClientError::Connection(format!("build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: format!("http://{local_host}:{local_port}"),
        })
    }

    /// Forward one relayed request to the origin. Infallible by contract:
    /// errors are folded into the response envelope.
    pub async fn forward(&self, request: RequestEnvelope) -> ResponseEnvelope {
        let request_id = request.request_id;
        debug!(request_id, method = %request.method, path = %request.path, "Forwarding to origin");
        match self.try_forward(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(request_id, error = %e, "Origin request failed");
                error_response(request_id, &e.to_string())
            }
        }
    }

    async fn try_forward(
        &self,
        request: RequestEnvelope,
    ) -> Result<ResponseEnvelope, ForwardFailure> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| ForwardFailure::BadMethod(request.method.clone()))?;
        let url = format!("{}{}", self.base_url, request.path);

        let mut header_map = HeaderMap::new();
        for (name, value) in request.headers.iter() {
            // Host is re-pointed at the origin by reqwest from the URL.
            if is_hop_by_hop(name)
                || name.eq_ignore_ascii_case("host")
                || name.eq_ignore_ascii_case("content-length")
            {
                continue;
            }
            let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) else {
                debug!(header = %name, "Dropping invalid header on origin request");
                continue;
            };
            header_map.append(name, value);
        }

        let response = self
            .http
            .request(method, &url)
            .headers(header_map)
            .body(request.body)
            .send()
            .await?;

        let status = response.status().as_u16();
        let reason = response.status().canonical_reason().map(str::to_string);
        let mut headers = Headers::new();
        for (name, value) in response.headers() {
            if is_hop_by_hop(name.as_str()) {
                continue;
            }
            if let Ok(value) = value.to_str() {
                headers.push(name.as_str(), value);
            }
        }
        let body = response.bytes().await?.to_vec();

        Ok(ResponseEnvelope {
            request_id: request.request_id,
            status,
            reason,
            headers,
            body,
        })
    }
}

/// 502 envelope carrying the failure cause in `X-Tunnel-Error`.
pub(crate) fn error_response(request_id: u64, message: &str) -> ResponseEnvelope {
    let mut headers = Headers::new();
    headers.push("X-Tunnel-Error", message.replace(['\r', '\n'], " "));
    headers.push("Content-Type", "text/plain; charset=utf-8");
    ResponseEnvelope {
        request_id,
        status: 502,
        reason: Some("origin unreachable".into()),
        headers,
        body: format!("origin request failed: {message}\n").into_bytes(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const CANNED_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nX-Origin: yes\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok";

    /// Minimal origin stub: reads request headers, answers with a canned
    /// response, closes.
    async fn spawn_origin(response: &'static [u8]) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 64 * 1024];
                    let mut total = 0;
                    loop {
                        match socket.read(&mut buf[total..]).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                total += n;
                                if buf[..total].windows(4).any(|w| w == b"\r\n\r\n") {
                                    break;
                                }
                            }
                        }
                    }
                    let _ = socket.write_all(response).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        addr
    }

    fn request(request_id: u64) -> RequestEnvelope {
        let mut headers = Headers::new();
        headers.push("X-Test", "1");
        headers.push("Connection", "keep-alive");
        RequestEnvelope {
            request_id,
            method: "GET".into(),
            path: "/hello".into(),
            headers,
            body: Vec::new(),
        }
    }

    #[tokio::test]
    async fn forwards_and_builds_response_envelope() {
        let origin = spawn_origin(CANNED_RESPONSE).await;
        let forwarder =
            LocalForwarder::new("127.0.0.1", origin.port(), Duration::from_secs(5)).unwrap();

        let response = forwarder.forward(request(3)).await;
        assert_eq!(response.request_id, 3);
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"ok");
        assert_eq!(response.headers.get("x-origin"), Some("yes"));
        // Hop-by-hop headers from the origin never enter the envelope.
        assert!(!response.headers.contains("connection"));
    }

    #[tokio::test]
    async fn unreachable_origin_maps_to_502() {
        // Port from a listener we immediately drop: connection refused.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let forwarder =
            LocalForwarder::new("127.0.0.1", addr.port(), Duration::from_secs(1)).unwrap();

        let response = forwarder.forward(request(9)).await;
        assert_eq!(response.request_id, 9);
        assert_eq!(response.status, 502);
        assert!(response.headers.contains("X-Tunnel-Error"));
        assert_eq!(response.reason.as_deref(), Some("origin unreachable"));
    }

    #[tokio::test]
    async fn invalid_method_maps_to_502() {
        let origin = spawn_origin(CANNED_RESPONSE).await;
        let forwarder =
            LocalForwarder::new("127.0.0.1", origin.port(), Duration::from_secs(1)).unwrap();

        let mut bad = request(4);
        bad.method = "NOT A METHOD".into();
        let response = forwarder.forward(bad).await;
        assert_eq!(response.status, 502);
        assert!(response
            .headers
            .get("X-Tunnel-Error")
            .unwrap()
            .contains("invalid method"));
    }
}
