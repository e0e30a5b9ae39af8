//! gale tunnel client.
//!
//! Connects out to a gale server, claims a subdomain, and forwards relayed
//! requests to a local HTTP service.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

use gale_client::ConnectionManager;
use gale_core::config::{self, ClientConfig};
use gale_core::init_tracing;
use gale_proto::subdomain;

#[derive(Parser, Debug)]
#[command(name = "gale-client")]
#[command(
    version,
    about = "gale tunnel client - exposes a local HTTP service through a gale server"
)]
struct Args {
    /// Server address
    #[arg(long, env = "GALE_SERVER")]
    server: Option<String>,

    /// Server control port
    #[arg(long, env = "GALE_SERVER_PORT")]
    server_port: Option<u16>,

    /// Local origin host
    #[arg(long, env = "GALE_LOCAL")]
    local: Option<String>,

    /// Local origin port
    #[arg(long, env = "GALE_LOCAL_PORT")]
    local_port: Option<u16>,

    /// Subdomain to claim on the server
    #[arg(long, env = "GALE_SUBDOMAIN")]
    subdomain: Option<String>,

    /// Connect without TLS
    #[arg(long)]
    no_ssl: bool,

    /// Skip TLS certificate verification (self-signed servers)
    #[arg(long)]
    insecure: bool,

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
    init_tracing("gale_client=info", args.log_json);

    let cfg = match resolve_config(&args) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    let label = match &cfg.subdomain {
        Some(raw) => match subdomain::normalize(raw) {
            Ok(label) => label,
            Err(e) => {
                error!(subdomain = %raw, error = %e, "Invalid subdomain");
                return ExitCode::from(EXIT_CONFIG_ERROR);
            }
        },
        None => {
            error!("--subdomain is required (flag or config file)");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    // The Err case just means a provider was already installed.
    let _ = tokio_rustls::rustls::crypto::ring::default_provider().install_default();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        server = %cfg.server_host,
        server_port = cfg.server_port,
        local = %format!("{}:{}", cfg.local_host, cfg.local_port),
        subdomain = %label,
        tls = cfg.use_ssl,
        "Starting gale-client"
    );

    let mut manager = match ConnectionManager::new(cfg, label) {
        Ok(manager) => manager,
        Err(e) => {
            error!(error = %e, "Failed to initialise tunnel client");
            return ExitCode::from(EXIT_STARTUP_FAILURE);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received termination signal");
            let _ = shutdown_tx.send(true);
        }
    });

    manager.run(shutdown_rx).await;
    ExitCode::SUCCESS
}

/// Overlay CLI flags on the config file (or defaults).
fn resolve_config(args: &Args) -> gale_core::Result<ClientConfig> {
    let mut cfg = config::load_config(args.config.as_deref())?.client;

    if let Some(server) = &args.server {
        cfg.server_host = server.clone();
    }
    if let Some(port) = args.server_port {
        cfg.server_port = port;
    }
    if let Some(local) = &args.local {
        cfg.local_host = local.clone();
    }
    if let Some(port) = args.local_port {
        cfg.local_port = port;
    }
    if let Some(subdomain) = &args.subdomain {
        cfg.subdomain = Some(subdomain.clone());
    }
    if args.no_ssl {
        cfg.use_ssl = false;
    }
    if args.insecure {
        cfg.insecure = true;
    }
    Ok(cfg)
}
