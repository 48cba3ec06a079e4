//! TLS material loading.

use std::path::Path;
use std::sync::Arc;
use wsproxy_core::{ProxyError, ProxyResult};

/// Load TLS certificate and key from PEM files, returning a rustls ServerConfig.
pub fn load_tls_config(cert_path: &Path, key_path: &Path) -> ProxyResult<rustls::ServerConfig> {
    let cert_pem = std::fs::read(cert_path).map_err(|e| {
        ProxyError::Other(format!("cannot read cert {}: {e}", cert_path.display()))
    })?;
    let key_pem = std::fs::read(key_path)
        .map_err(|e| ProxyError::Other(format!("cannot read key {}: {e}", key_path.display())))?;

    let certs: Vec<rustls::pki_types::CertificateDer<'static>> =
        rustls_pemfile::certs(&mut &cert_pem[..])
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ProxyError::Other(format!("invalid cert PEM: {e}")))?;
    if certs.is_empty() {
        return Err(ProxyError::Other(format!(
            "no certificate found in {}",
            cert_path.display()
        )));
    }

    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| ProxyError::Other(format!("invalid key PEM: {e}")))?
        .ok_or_else(|| {
            ProxyError::Other(format!("no private key found in {}", key_path.display()))
        })?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut tls_config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ProxyError::Other(format!("TLS setup failed: {e}")))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ProxyError::Other(format!("TLS setup failed: {e}")))?;

    // WebSocket upgrade happens over HTTP/1.1.
    tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(tls_config)
}
