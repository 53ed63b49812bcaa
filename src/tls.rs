//! Per-handshake TLS configuration.
//! Certificates are read from disk for every handshake so a rotated pair is
//! used by the next connection without a restart.

use crate::error::{GatewayError, Result};
use rustls::ServerConfig;
use std::path::Path;
use std::sync::Arc;

/// Build a server configuration from a PEM certificate chain and key
pub async fn load_server_config(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>> {
    let cert_pem = tokio::fs::read(cert_path).await?;
    let key_pem = tokio::fs::read(key_path).await?;

    let certs = rustls_pemfile::certs(&mut cert_pem.as_slice()).collect::<std::result::Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(GatewayError::Config(format!(
            "no certificate found in {}",
            cert_path.display()
        )));
    }

    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())?
        .ok_or_else(|| GatewayError::Config(format!("no private key found in {}", key_path.display())))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}
