//! Shared ambient pieces for the gale server and client: configuration
//! resolution, error types, tracing setup, and the reconnect backoff policy.

pub mod backoff;
pub mod config;
pub mod error;
pub mod tracing_init;

pub use backoff::BackoffPolicy;
pub use config::{load_config, ClientConfig, Config, ServerConfig};
pub use error::{Error, Result};
pub use tracing_init::init_tracing;
