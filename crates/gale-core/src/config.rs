//! Configuration for the gale server and client.
//!
//! Resolution order, lowest to highest priority:
//! 1. Built-in defaults
//! 2. Config file (JSON, `server` and `client` sections)
//! 3. CLI arguments (applied by the binaries)

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Complete gale configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

/// Server-side configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address for both listeners.
    pub host: String,
    /// Control channel port (client connections).
    pub control_port: u16,
    /// Public HTTP port.
    pub http_port: u16,
    /// Apex zone stripped from Host headers to find the tunnel label.
    pub zone: String,
    /// Serve TLS on both listeners. Requires `cert_file` and `key_file`.
    pub use_ssl: bool,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    /// Close a session after this long without any frame from its client.
    pub heartbeat_timeout_secs: u64,
    /// How long the front-end waits for a tunneled response.
    pub request_timeout_secs: u64,
    /// Largest request body accepted from public HTTP peers.
    pub max_body_bytes: usize,
    /// How long a new control connection may take to send REGISTER.
    pub handshake_timeout_secs: u64,
    /// Redact client addresses to /24 on the status page.
    pub redact_peer_addrs: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            control_port: 8000,
            http_port: 80,
            zone: "localhost".to_string(),
            use_ssl: true,
            cert_file: None,
            key_file: None,
            heartbeat_timeout_secs: 60,
            request_timeout_secs: 30,
            max_body_bytes: 10 * 1024 * 1024, // 10 MiB
            handshake_timeout_secs: 10,
            redact_peer_addrs: false,
        }
    }
}

impl ServerConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

/// Client-side configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub server_host: String,
    pub server_port: u16,
    /// Origin service the tunnel forwards to.
    pub local_host: String,
    pub local_port: u16,
    /// Subdomain to claim. Required at startup.
    pub subdomain: Option<String>,
    /// Wrap the control connection in TLS.
    pub use_ssl: bool,
    /// Skip TLS certificate verification. Loudly discouraged.
    pub insecure: bool,
    pub heartbeat_interval_secs: u64,
    /// Force a reconnect after this long without a heartbeat ack.
    pub heartbeat_timeout_secs: u64,
    /// Per-request timeout for the origin round-trip.
    pub request_timeout_secs: u64,
    /// Maximum requests dispatched to the origin concurrently.
    pub in_flight_limit: usize,
    /// How long to wait for REGISTER_ACK after connecting.
    pub register_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_host: "127.0.0.1".to_string(),
            server_port: 8000,
            local_host: "127.0.0.1".to_string(),
            local_port: 8080,
            subdomain: None,
            use_ssl: true,
            insecure: false,
            heartbeat_interval_secs: 20,
            heartbeat_timeout_secs: 60,
            request_timeout_secs: 30,
            in_flight_limit: 128,
            register_timeout_secs: 10,
        }
    }
}

impl ClientConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn register_timeout(&self) -> Duration {
        Duration::from_secs(self.register_timeout_secs)
    }
}

/// Load configuration, starting from defaults and overlaying the given file
/// when present. A path that does not exist is a configuration error; the
/// binaries map that to their config-error exit code.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let Some(path) = path else {
        return Ok(Config::default());
    };
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!(
            "Failed to read config file {}: {}",
            path.display(),
            e
        ))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!(
            "Failed to parse config file {}: {}",
            path.display(),
            e
        ))
    })
}
