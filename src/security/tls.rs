//! TLS/STARTTLS support.
//!
//! Server side: a rustls `ServerConfig` loaded from PEM files, or generated
//! self-signed when no paths are configured (development only). Relay side:
//! a client connector that skips certificate verification, matching the
//! upstream behaviour of the forwarding path.

use crate::error::{MailError, Result};
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, PrivateKey, ServerConfig, ServerName};
use rustls_pemfile::{certs, pkcs8_private_keys};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info};

/// Immutable TLS context, built once at startup and shared by reference.
#[derive(Clone)]
pub struct TlsConfig {
    server_config: Arc<ServerConfig>,
}

impl TlsConfig {
    /// Create TLS config from certificate and key files.
    pub fn from_pem_files<P: AsRef<Path>>(cert_path: P, key_path: P) -> Result<Self> {
        info!("Loading TLS certificate from {:?}", cert_path.as_ref());

        let cert_file = File::open(cert_path.as_ref())
            .map_err(|e| MailError::Tls(format!("Failed to open certificate file: {}", e)))?;
        let mut cert_reader = BufReader::new(cert_file);

        let certs = certs(&mut cert_reader)
            .map_err(|e| MailError::Tls(format!("Failed to read certificates: {}", e)))?;

        if certs.is_empty() {
            return Err(MailError::Tls("No certificates found in file".to_string()));
        }

        debug!("Loaded {} certificate(s)", certs.len());

        let key_file = File::open(key_path.as_ref())
            .map_err(|e| MailError::Tls(format!("Failed to open key file: {}", e)))?;
        let mut key_reader = BufReader::new(key_file);

        let mut keys = pkcs8_private_keys(&mut key_reader)
            .map_err(|e| MailError::Tls(format!("Failed to read private keys: {}", e)))?;

        if keys.is_empty() {
            return Err(MailError::Tls("No private key found in file".to_string()));
        }

        let private_key = keys.remove(0);

        Self::from_der(
            certs.into_iter().map(Certificate).collect(),
            PrivateKey(private_key),
        )
    }

    /// Generate a throwaway self-signed certificate for the given domain.
    /// Development fallback when no certificate paths are configured.
    pub fn self_signed(domain: &str) -> Result<Self> {
        info!("Generating self-signed certificate for {}", domain);

        let cert = rcgen::generate_simple_self_signed(vec![domain.to_string()])
            .map_err(|e| MailError::Tls(format!("Failed to generate certificate: {}", e)))?;

        let cert_der = cert
            .serialize_der()
            .map_err(|e| MailError::Tls(format!("Failed to serialize certificate: {}", e)))?;
        let key_der = cert.serialize_private_key_der();

        Self::from_der(vec![Certificate(cert_der)], PrivateKey(key_der))
    }

    fn from_der(certs: Vec<Certificate>, key: PrivateKey) -> Result<Self> {
        let config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| MailError::Tls(format!("Failed to create TLS config: {}", e)))?;

        Ok(Self {
            server_config: Arc::new(config),
        })
    }

    /// TLS acceptor for the STARTTLS upgrade.
    pub fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(self.server_config.clone())
    }
}

/// Certificate verifier that accepts anything. The relay path connects to
/// arbitrary MX hosts without a trust store, like the upstream forwarder.
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
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

/// TLS connector for outbound relay connections.
pub fn relay_connector() -> TlsConnector {
    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
        .with_no_client_auth();

    TlsConnector::from(Arc::new(config))
}
