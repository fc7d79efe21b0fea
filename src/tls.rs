//! TLS termination for the gateway listener.
//!
//! Loads a PEM certificate chain and private key into a rustls
//! `ServerConfig` wrapped in a `TlsAcceptor`, which the accept loop in
//! [`crate::server`] uses per connection.

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tokio_rustls::TlsAcceptor;

#[derive(Error, Debug)]
pub enum TlsError {
    #[error("failed to read TLS certificate file: {0}")]
    CertRead(std::io::Error),
    #[error("failed to read TLS key file: {0}")]
    KeyRead(std::io::Error),
    #[error("no certificates found in PEM file")]
    NoCerts,
    #[error("no private key found in PEM file")]
    NoKey,
    #[error("failed to build TLS config: {0}")]
    Config(tokio_rustls::rustls::Error),
}

/// Build a `TlsAcceptor` from PEM files. The key may be PKCS8, RSA or EC.
pub fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, TlsError> {
    let cert_data = std::fs::read(cert_path).map_err(TlsError::CertRead)?;
    let certs = rustls_pemfile::certs(&mut &cert_data[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(TlsError::CertRead)?;
    if certs.is_empty() {
        return Err(TlsError::NoCerts);
    }

    let key_data = std::fs::read(key_path).map_err(TlsError::KeyRead)?;
    let key = rustls_pemfile::private_key(&mut &key_data[..])
        .map_err(TlsError::KeyRead)?
        .ok_or(TlsError::NoKey)?;

    // Idempotent; a provider may already be installed.
    let _ = tokio_rustls::rustls::crypto::aws_lc_rs::default_provider().install_default();

    let config = tokio_rustls::rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(TlsError::Config)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_pair(dir: &Path, cert: &str, key: &str) -> (std::path::PathBuf, std::path::PathBuf) {
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        std::fs::write(&cert_path, cert).unwrap();
        std::fs::write(&key_path, key).unwrap();
        (cert_path, key_path)
    }

    #[test]
    fn missing_cert_file() {
        let result = load_tls_config(
            Path::new("/nonexistent/ptygate/cert.pem"),
            Path::new("/nonexistent/ptygate/key.pem"),
        );
        assert!(matches!(result, Err(TlsError::CertRead(_))));
    }

    #[test]
    fn empty_cert_file() {
        let dir = tempfile::tempdir().unwrap();
        let (cert, key) = write_pair(dir.path(), "", "");
        assert!(matches!(load_tls_config(&cert, &key), Err(TlsError::NoCerts)));
    }

    #[test]
    fn self_signed_pair_loads() {
        let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let (cert, key) = write_pair(
            dir.path(),
            &generated.cert.pem(),
            &generated.key_pair.serialize_pem(),
        );
        let result = load_tls_config(&cert, &key);
        assert!(result.is_ok(), "self-signed pair should load: {:?}", result.err());
    }

    #[test]
    fn garbage_key_file() {
        let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let (cert, key) = write_pair(dir.path(), &generated.cert.pem(), "not a key");
        assert!(matches!(load_tls_config(&cert, &key), Err(TlsError::NoKey)));
    }
}
