//! TLS termination.
//!
//! Loads certificate and private key material from PEM files into a
//! `rustls::ServerConfig` for the HTTPS listener.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;

use slipstream_core::error::Error;

/// Load a server-side TLS configuration from the given PEM files.
///
/// Accepts PKCS#8, RSA and SEC1 private keys. TLS 1.2 is the floor; 1.3 is
/// preferred when the client supports it.
pub fn load_server_config(cert_path: &str, key_path: &str) -> Result<Arc<ServerConfig>, Error> {
    let cert_file = File::open(cert_path)
        .map_err(|e| Error::Tls(format!("failed to read certificate {cert_path}: {e}")))?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("failed to parse certificate {cert_path}: {e}")))?;
    if certs.is_empty() {
        return Err(Error::Tls(format!("no certificates found in {cert_path}")));
    }

    let key_file = File::open(key_path)
        .map_err(|e| Error::Tls(format!("failed to read private key {key_path}: {e}")))?;
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|e| Error::Tls(format!("failed to parse private key {key_path}: {e}")))?
        .ok_or_else(|| Error::Tls(format!("no private key found in {key_path}")))?;

    let mut config = ServerConfig::builder_with_protocol_versions(&[
        &rustls::version::TLS13,
        &rustls::version::TLS12,
    ])
    .with_no_client_auth()
    .with_single_cert(certs, key)
    .map_err(|e| Error::Tls(format!("invalid certificate/key pair: {e}")))?;

    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}
