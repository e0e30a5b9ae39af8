//! gale tunnel server.
//!
//! Binds two listeners: the control channel for tunnel clients and the
//! public HTTP front-end that routes requests by Host label.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

use gale_core::config::{self, ServerConfig};
use gale_core::init_tracing;
use gale_server::control::run_control_listener;
use gale_server::frontend::{self, FrontendState};
use gale_server::registry::TunnelRegistry;
use gale_server::tls;

#[derive(Parser, Debug)]
#[command(name = "gale-server")]
#[command(version, about = "gale tunnel server - public rendezvous for HTTP tunnels")]
struct Args {
    /// Bind address for both listeners
    #[arg(long, env = "GALE_HOST")]
    host: Option<String>,

    /// Control channel port for tunnel clients
    #[arg(long, env = "GALE_CONTROL_PORT")]
    control_port: Option<u16>,

    /// Public HTTP port
    #[arg(long, env = "GALE_HTTP_PORT")]
    http_port: Option<u16>,

    /// Apex zone served by this node (e.g. "example.com")
    #[arg(long, env = "GALE_ZONE")]
    zone: Option<String>,

    /// Disable TLS on both listeners
    #[arg(long)]
    no_ssl: bool,

    /// PEM certificate chain
    #[arg(long, env = "GALE_CERT")]
    cert: Option<PathBuf>,

    /// PEM private key
    #[arg(long, env = "GALE_KEY")]
    key: Option<PathBuf>,

    /// Optional JSON config file (CLI flags override it)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output logs as JSON (for structured log aggregation)
    #[arg(long, env = "GALE_LOG_JSON")]
    log_json: bool,
}

const EXIT_STARTUP_FAILURE: u8 = 1;
const EXIT_CONFIG_ERROR: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing("gale_server=info", args.log_json);

    let cfg = match resolve_config(&args) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    match run(cfg).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Server startup failed");
            ExitCode::from(EXIT_STARTUP_FAILURE)
        }
    }
}

/// Overlay CLI flags on the config file (or defaults) and validate.
fn resolve_config(args: &Args) -> gale_core::Result<ServerConfig> {
    let mut cfg = config::load_config(args.config.as_deref())?.server;

    if let Some(host) = &args.host {
        cfg.host = host.clone();
    }
    if let Some(port) = args.control_port {
        cfg.control_port = port;
    }
    if let Some(port) = args.http_port {
        cfg.http_port = port;
    }
    if let Some(zone) = &args.zone {
        cfg.zone = zone.to_ascii_lowercase();
    }
    if let Some(cert) = &args.cert {
        cfg.cert_file = Some(cert.clone());
    }
    if let Some(key) = &args.key {
        cfg.key_file = Some(key.clone());
    }
    if args.no_ssl {
        cfg.use_ssl = false;
    }

    if cfg.use_ssl && (cfg.cert_file.is_none() || cfg.key_file.is_none()) {
        return Err(gale_core::Error::Config(
            "TLS is enabled but --cert/--key are missing (pass --no-ssl for plaintext)".into(),
        ));
    }
    if cfg.zone.is_empty() {
        return Err(gale_core::Error::Config("zone must not be empty".into()));
    }
    Ok(cfg)
}

async fn run(cfg: ServerConfig) -> anyhow::Result<()> {
    // reqwest and tokio-rustls both link rustls; install one provider for
    // the whole process. The Err case just means it was already installed.
    let _ = tokio_rustls::rustls::crypto::ring::default_provider().install_default();

    let acceptor = match (&cfg.use_ssl, &cfg.cert_file, &cfg.key_file) {
        (true, Some(cert), Some(key)) => Some(tls::load_acceptor(cert, key)?),
        _ => None,
    };

    let control_addr = format!("{}:{}", cfg.host, cfg.control_port);
    let control_listener = TcpListener::bind(&control_addr)
        .await
        .with_context(|| format!("failed to bind control listener on {control_addr}"))?;

    let http_addr = format!("{}:{}", cfg.host, cfg.http_port);
    let http_listener = TcpListener::bind(&http_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {http_addr}"))?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        control = %control_addr,
        http = %http_addr,
        zone = %cfg.zone,
        tls = cfg.use_ssl,
        "Starting gale-server"
    );

    let cfg = Arc::new(cfg);
    let registry = TunnelRegistry::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let state = FrontendState {
        registry: registry.clone(),
        config: Arc::clone(&cfg),
        started_at: std::time::Instant::now(),
        tls: cfg.use_ssl,
    };

    let control_task = tokio::spawn(run_control_listener(
        control_listener,
        acceptor.clone(),
        registry,
        Arc::clone(&cfg),
        shutdown_rx.clone(),
    ));
    let frontend_task = match acceptor {
        Some(acceptor) => tokio::spawn(frontend::serve_tls(
            http_listener,
            state,
            acceptor,
            shutdown_rx.clone(),
        )),
        None => tokio::spawn(frontend::serve_plain(http_listener, state, shutdown_rx)),
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Received shutdown signal");
    let _ = shutdown_tx.send(true);

    let _ = control_task.await;
    let _ = frontend_task.await;
    info!("Server stopped");
    Ok(())
}
