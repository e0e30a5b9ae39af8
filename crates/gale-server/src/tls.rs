//! TLS identity loading for the server listeners.
//!
//! The server only consumes PEM material handed to it via `--cert`/`--key`;
//! provisioning and renewal happen outside this process.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig as RustlsServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("Failed to load TLS material: {0}")]
    Load(String),

    #[error("Invalid certificate/key pair: {0}")]
    Invalid(String),
}

/// Build a TLS acceptor from PEM certificate chain and private key files.
pub fn load_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, TlsError> {
    let cert_file = File::open(cert_path)
        .map_err(|e| TlsError::Load(format!("{}: {e}", cert_path.display())))?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<Result<_, _>>()
        .map_err(|e| TlsError::Load(format!("{}: {e}", cert_path.display())))?;
    if certs.is_empty() {
        return Err(TlsError::Load(format!(
            "{}: no certificates found",
            cert_path.display()
        )));
    }

    let key_file = File::open(key_path)
        .map_err(|e| TlsError::Load(format!("{}: {e}", key_path.display())))?;
    let key: PrivateKeyDer<'static> =
        rustls_pemfile::private_key(&mut BufReader::new(key_file))
            .map_err(|e| TlsError::Load(format!("{}: {e}", key_path.display())))?
            .ok_or_else(|| {
                TlsError::Load(format!("{}: no private key found", key_path.display()))
            })?;

    let config = RustlsServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TlsError::Invalid(e.to_string()))?;

    info!(
        cert = %cert_path.display(),
        key = %key_path.display(),
        "TLS enabled"
    );
    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn missing_cert_is_a_load_error() {
        let result = load_acceptor(
            &PathBuf::from("/nonexistent/cert.pem"),
            &PathBuf::from("/nonexistent/key.pem"),
        );
        match result {
            Err(err) => assert!(matches!(err, TlsError::Load(_))),
            Ok(_) => panic!("expected an error"),
        }
    }
}
