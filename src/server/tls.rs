//! TLS termination
//!
//! Cipher policy is narrowed to ChaCha20-Poly1305: the target ARM core has
//! no AES instructions, and constant-time ChaCha is both faster and safer
//! there. TLS 1.2 stays enabled for older clients, restricted to the ECDHE
//! ChaCha suites.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use std::sync::Arc;

use rustls::crypto::ring;
use rustls::crypto::CryptoProvider;
use tracing::info;

use crate::error::Result;

/// The only cipher suites this server offers.
fn chacha_suites() -> Vec<rustls::SupportedCipherSuite> {
    vec![
        ring::cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
        ring::cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
        ring::cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
    ]
}

/// Build the server TLS config from PEM readers.
pub fn config_from_pem(
    cert_pem: &mut dyn Read,
    key_pem: &mut dyn Read,
) -> Result<Arc<rustls::ServerConfig>> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_pem))
        .collect::<io::Result<Vec<_>>>()?;
    if certs.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "no certificates in PEM").into());
    }
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_pem))?
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no private key in PEM"))?;

    let provider = CryptoProvider {
        cipher_suites: chacha_suites(),
        ..ring::default_provider()
    };

    let config = rustls::ServerConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(rustls::ALL_VERSIONS)?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(Arc::new(config))
}

/// Load certificate and key from the paths given on the command line.
pub fn load_server_config(
    cert_path: impl AsRef<Path>,
    key_path: impl AsRef<Path>,
) -> Result<Arc<rustls::ServerConfig>> {
    let mut cert = File::open(cert_path.as_ref())?;
    let mut key = File::open(key_path.as_ref())?;
    let config = config_from_pem(&mut cert, &mut key)?;
    info!(
        cert = %cert_path.as_ref().display(),
        "tls configured (chacha20-poly1305 only)"
    );
    Ok(config)
}
