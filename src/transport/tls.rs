//! # TLS Layer
//!
//! Certificate loading and handshake helpers shared by every transport that
//! can run over TLS (TCP, KCP and WebSocket).
//!
//! ## Responsibilities
//! - Load PEM certificate chains and PKCS#8 keys into a rustls config
//! - Generate self-signed material for development
//! - Build client configs with native roots, SHA-256 pinning or no verification
//! - Run server and client handshakes under a deadline

use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore, ServerConfig, ServerName};
use rustls_pemfile::{certs, pkcs8_private_keys};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::client::TlsStream as ClientTlsStream;
use tokio_rustls::server::TlsStream as ServerTlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, warn};

use crate::error::{ProtocolError, Result};
use crate::utils::timeout::with_deadline;

/// Handshakes that take longer than this are abandoned
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Read every certificate from a PEM file.
pub fn load_certs<P: AsRef<Path>>(path: P) -> Result<Vec<Certificate>> {
    let file = File::open(path.as_ref())
        .map_err(|e| ProtocolError::TlsError(format!("Failed to open cert file: {e}")))?;
    let mut reader = BufReader::new(file);
    let chain = certs(&mut reader)
        .map_err(|_| ProtocolError::TlsError("Failed to parse certificate".into()))?;

    if chain.is_empty() {
        return Err(ProtocolError::TlsError("No certificates found".into()));
    }
    Ok(chain.into_iter().map(Certificate).collect())
}

/// Read the first PKCS#8 private key from a PEM file.
pub fn load_private_key<P: AsRef<Path>>(path: P) -> Result<PrivateKey> {
    let file = File::open(path.as_ref())
        .map_err(|e| ProtocolError::TlsError(format!("Failed to open key file: {e}")))?;
    let mut reader = BufReader::new(file);
    let keys = pkcs8_private_keys(&mut reader)
        .map_err(|_| ProtocolError::TlsError("Failed to parse private key".into()))?;

    keys.into_iter()
        .next()
        .map(PrivateKey)
        .ok_or_else(|| ProtocolError::TlsError("No private keys found".into()))
}

/// TLS server configuration
#[derive(Debug, Clone)]
pub struct TlsServerConfig {
    cert_path: String,
    key_path: String,
}

impl TlsServerConfig {
    pub fn new<P: AsRef<Path>>(cert_path: P, key_path: P) -> Self {
        Self {
            cert_path: cert_path.as_ref().to_string_lossy().to_string(),
            key_path: key_path.as_ref().to_string_lossy().to_string(),
        }
    }

    /// Generate a self-signed certificate for `localhost` and write it out as PEM.
    pub fn generate_self_signed<P: AsRef<Path>>(cert_path: P, key_path: P) -> io::Result<Self> {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()])
            .map_err(|e| io::Error::other(format!("Certificate generation error: {e}")))?;

        let mut cert_file = File::create(&cert_path)?;
        cert_file.write_all(cert.cert.pem().as_bytes())?;

        let mut key_file = File::create(&key_path)?;
        key_file.write_all(cert.signing_key.serialize_pem().as_bytes())?;

        Ok(Self::new(cert_path, key_path))
    }

    pub fn cert_path(&self) -> &str {
        &self.cert_path
    }

    pub fn load_server_config(&self) -> Result<ServerConfig> {
        let cert_chain = load_certs(&self.cert_path)?;
        let private_key = load_private_key(&self.key_path)?;

        ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(cert_chain, private_key)
            .map_err(|e| ProtocolError::TlsError(format!("TLS error: {e}")))
    }
}

/// TLS client configuration
#[derive(Debug, Clone)]
pub struct TlsClientConfig {
    server_name: String,
    insecure: bool,
    /// SHA-256 fingerprint the server certificate must match
    pinned_cert_hash: Option<Vec<u8>>,
}

impl TlsClientConfig {
    pub fn new<S: Into<String>>(server_name: S) -> Self {
        Self {
            server_name: server_name.into(),
            insecure: false,
            pinned_cert_hash: None,
        }
    }

    /// Skip CA verification.
    ///
    /// Only meant for development. Pair it with
    /// [`with_pinned_cert_hash`](Self::with_pinned_cert_hash) to still check
    /// a specific certificate.
    pub fn insecure(mut self) -> Self {
        warn!("INSECURE MODE ENABLED: Certificate verification is disabled. This should only be used for development/testing.");
        self.insecure = true;
        self
    }

    /// Only accept a server certificate with this SHA-256 hash
    pub fn with_pinned_cert_hash(mut self, hash: Vec<u8>) -> Self {
        if hash.len() != 32 {
            warn!(
                "Certificate hash has unexpected length: {} (expected 32 bytes for SHA-256)",
                hash.len()
            );
        }
        self.pinned_cert_hash = Some(hash);
        self
    }

    pub fn calculate_cert_hash(cert: &Certificate) -> Vec<u8> {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(&cert.0);
        hasher.finalize().to_vec()
    }

    pub fn load_client_config(&self) -> Result<ClientConfig> {
        let builder = ClientConfig::builder().with_safe_defaults();

        if !self.insecure {
            let mut root_store = RootCertStore::empty();
            let native_certs = rustls_native_certs::load_native_certs().map_err(|e| {
                ProtocolError::TlsError(format!("Failed to load native certs: {e}"))
            })?;

            for cert in native_certs {
                if let Err(e) = root_store.add(&Certificate(cert.0)) {
                    debug!(error = %e, "Skipping unusable native root certificate");
                }
            }

            return Ok(builder
                .with_root_certificates(root_store)
                .with_no_client_auth());
        }

        let config = match &self.pinned_cert_hash {
            Some(hash) => builder
                .with_custom_certificate_verifier(Arc::new(PinnedCertVerifier {
                    fingerprint: hash.clone(),
                }))
                .with_no_client_auth(),
            None => builder
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
                .with_no_client_auth(),
        };
        Ok(config)
    }

    pub fn server_name(&self) -> Result<ServerName> {
        ServerName::try_from(self.server_name.as_str())
            .map_err(|_| ProtocolError::TlsError("Invalid server name".into()))
    }
}

struct PinnedCertVerifier {
    fingerprint: Vec<u8>,
}

impl rustls::client::ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<rustls::client::ServerCertVerified, rustls::Error> {
        if TlsClientConfig::calculate_cert_hash(end_entity) == self.fingerprint {
            Ok(rustls::client::ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General(
                "Pinned certificate hash mismatch".into(),
            ))
        }
    }
}

struct AcceptAnyServerCert;

impl rustls::client::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

/// Server side of the handshake over any byte stream.
pub async fn accept<S>(acceptor: &TlsAcceptor, stream: S) -> Result<ServerTlsStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    with_deadline(Some(HANDSHAKE_TIMEOUT), async {
        acceptor
            .accept(stream)
            .await
            .map_err(|e| ProtocolError::TlsError(format!("TLS handshake failed: {e}")))
    })
    .await
}

/// Client side of the handshake over any byte stream.
pub async fn connect<S>(
    config: Arc<ClientConfig>,
    server_name: ServerName,
    stream: S,
) -> Result<ClientTlsStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let connector = TlsConnector::from(config);
    with_deadline(Some(HANDSHAKE_TIMEOUT), async {
        connector
            .connect(server_name, stream)
            .await
            .map_err(|e| ProtocolError::TlsError(format!("TLS connection failed: {e}")))
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_signed_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");

        let config = TlsServerConfig::generate_self_signed(&cert, &key).unwrap();
        assert!(config.load_server_config().is_ok());
        assert_eq!(load_certs(&cert).unwrap().len(), 1);
    }

    #[test]
    fn test_missing_cert_file() {
        let config = TlsServerConfig::new("/nonexistent/cert.pem", "/nonexistent/key.pem");
        assert!(matches!(
            config.load_server_config(),
            Err(ProtocolError::TlsError(_))
        ));
    }

    #[test]
    fn test_pinned_client_config() {
        let hash = vec![7u8; 32];
        let client = TlsClientConfig::new("localhost")
            .insecure()
            .with_pinned_cert_hash(hash);
        assert!(client.load_client_config().is_ok());
        assert!(client.server_name().is_ok());
    }

    #[test]
    fn test_invalid_server_name() {
        let client = TlsClientConfig::new("not a hostname!");
        assert!(client.server_name().is_err());
    }
}
