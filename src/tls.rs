//! rustls configuration for the SMTP client upgrade and the debug server.

use std::io::BufReader as StdBufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{Context, Result};
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore, ServerConfig, ServerName};
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::NetError;

/// Accepts every server certificate. Only reachable through `--insecure`.
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

/// Connector trusting the platform roots, or anything when `accept_invalid_certs`.
pub fn client_connector(accept_invalid_certs: bool) -> std::result::Result<TlsConnector, NetError> {
    let config = if accept_invalid_certs {
        ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth()
    } else {
        let mut root_store = RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs()
            .map_err(|e| NetError::Tls(format!("Failed to load platform certificates: {}", e)))?;
        let der: Vec<Vec<u8>> = native.into_iter().map(|cert| cert.0).collect();
        let (added, _ignored) = root_store.add_parsable_certificates(&der);
        if added == 0 {
            return Err(NetError::Tls("No usable platform certificates".to_string()));
        }
        ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_store)
            .with_no_client_auth()
    };
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Name used for SNI and certificate checks. Accepts DNS names and IP literals.
pub fn server_name(host: &str) -> std::result::Result<ServerName, NetError> {
    ServerName::try_from(host).map_err(|e| NetError::Tls(format!("Invalid server name {}: {}", host, e)))
}

/// Builds an acceptor from PEM certificate chain and private key files.
pub fn load_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let cert_file = &mut std::fs::File::open(cert_path)
        .with_context(|| format!("Failed to open certificate: {:?}", cert_path))?;
    let mut cert_reader = StdBufReader::new(cert_file);
    let cert_chain: Vec<Certificate> = certs(&mut cert_reader)
        .map_err(|_| anyhow::anyhow!("Failed to parse certificate"))?
        .into_iter()
        .map(Certificate)
        .collect();
    if cert_chain.is_empty() {
        return Err(anyhow::anyhow!("No certificate found in {:?}", cert_path));
    }

    let read_keys = |parse: fn(&mut dyn std::io::BufRead) -> std::io::Result<Vec<Vec<u8>>>| -> Result<Vec<Vec<u8>>> {
        let key_file = std::fs::File::open(key_path)
            .with_context(|| format!("Failed to open private key: {:?}", key_path))?;
        let mut key_reader = StdBufReader::new(key_file);
        parse(&mut key_reader).map_err(|_| anyhow::anyhow!("Failed to parse private key"))
    };
    let mut keys = read_keys(pkcs8_private_keys)?;
    if keys.is_empty() {
        keys = read_keys(rsa_private_keys)?;
    }
    if keys.is_empty() {
        return Err(anyhow::anyhow!("No private key found"));
    }

    let private_key = PrivateKey(keys.remove(0));

    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(cert_chain, private_key)
        .map_err(|e| anyhow::anyhow!("Failed to build TLS config: {}", e))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}
