//! Control channel listener: accepts tunnel client connections and spawns a
//! session per connection, optionally terminating TLS first.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use gale_core::config::ServerConfig;

use crate::registry::TunnelRegistry;
use crate::session;

pub async fn run_control_listener(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    registry: TunnelRegistry,
    config: Arc<ServerConfig>,
    shutdown: watch::Receiver<bool>,
) {
    match listener.local_addr() {
        Ok(addr) => info!(addr = %addr, tls = acceptor.is_some(), "Control listener ready"),
        Err(_) => info!(tls = acceptor.is_some(), "Control listener ready"),
    }

    let mut shutdown_accept = shutdown.clone();
    loop {
        tokio::select! {
            _ = shutdown_accept.changed() => {
                info!("Control listener shutting down");
                return;
            }
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept control connection");
                        continue;
                    }
                };
                debug!(peer = %peer_addr, "Accepted control connection");

                let registry = registry.clone();
                let config = Arc::clone(&config);
                let shutdown = shutdown.clone();
                match acceptor.clone() {
                    Some(acceptor) => {
                        tokio::spawn(async move {
                            match acceptor.accept(stream).await {
                                Ok(tls_stream) => {
                                    session::handle_connection(
                                        tls_stream, peer_addr, true, registry, config, shutdown,
                                    )
                                    .await;
                                }
                                Err(e) => {
                                    warn!(
                                        peer = %peer_addr,
                                        error = %e,
                                        "TLS handshake failed on control connection"
                                    );
                                }
                            }
                        });
                    }
                    None => {
                        tokio::spawn(session::handle_connection(
                            stream, peer_addr, false, registry, config, shutdown,
                        ));
                    }
                }
            }
        }
    }
}
