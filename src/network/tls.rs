//! TLS material for peer connections
//!
//! A fresh self-signed certificate is generated on every run. Peers don't
//! authenticate each other through TLS (the handshake nonce and network id do
//! that job), so the client side accepts any certificate but still checks the
//! handshake signature.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Subdirectory of the data dir holding the generated material
const TLS_DIR: &str = "tls";

#[derive(Error, Debug)]
pub enum TlsError {
    #[error("Certificate generation failed: {0}")]
    Generation(#[from] rcgen::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Invalid private key: {0}")]
    InvalidKey(String),
    #[error("TLS configuration error: {0}")]
    Config(#[from] rustls::Error),
}

/// Generated certificate and key, in memory and on disk
pub struct TlsMaterial {
    pub cert_der: CertificateDer<'static>,
    pub key_der: Vec<u8>,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("cert_path", &self.cert_path)
            .field("key_path", &self.key_path)
            .finish_non_exhaustive()
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Generate a self-signed certificate and key, writing PEM copies under `data_dir`
pub fn generate_self_signed(data_dir: &Path) -> Result<TlsMaterial, TlsError> {
    use rcgen::{generate_simple_self_signed, CertifiedKey};

    let CertifiedKey { cert, key_pair } = generate_simple_self_signed(vec!["localhost".to_string()])?;

    let dir = data_dir.join(TLS_DIR);
    fs::create_dir_all(&dir)?;
    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");
    fs::write(&cert_path, cert.pem())?;
    write_private(&key_path, key_pair.serialize_pem().as_bytes())?;

    Ok(TlsMaterial {
        cert_der: cert.der().clone(),
        key_der: key_pair.serialize_der(),
        cert_path,
        key_path,
    })
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    fs::write(path, contents)
}

/// Server config for the inbound listener
pub fn server_config(material: &TlsMaterial) -> Result<Arc<ServerConfig>, TlsError> {
    let key = PrivateKeyDer::try_from(material.key_der.clone())
        .map_err(|e| TlsError::InvalidKey(e.to_string()))?;

    let config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(vec![material.cert_der.clone()], key)?;

    Ok(Arc::new(config))
}

/// Client config for outbound connections; accepts self-signed peers
pub fn client_config() -> Result<Arc<ClientConfig>, TlsError> {
    let provider = provider();
    let config = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AnyPeerCertificate { provider }))
        .with_no_client_auth();

    Ok(Arc::new(config))
}

/// Accepts any server certificate but verifies handshake signatures
#[derive(Debug)]
struct AnyPeerCertificate {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AnyPeerCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_and_build_configs() {
        let temp_dir = tempfile::tempdir().unwrap();

        let material = generate_self_signed(temp_dir.path()).unwrap();
        assert!(material.cert_path.exists());
        assert!(material.key_path.exists());

        let pem = fs::read_to_string(&material.cert_path).unwrap();
        assert!(pem.contains("BEGIN CERTIFICATE"));

        assert!(server_config(&material).is_ok());
        assert!(client_config().is_ok());
    }

    #[test]
    fn test_fresh_material_each_run() {
        let temp_dir = tempfile::tempdir().unwrap();

        let first = generate_self_signed(temp_dir.path()).unwrap();
        let second = generate_self_signed(temp_dir.path()).unwrap();
        assert_ne!(first.cert_der, second.cert_der);
    }

    #[test]
    fn test_bad_key_rejected() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut material = generate_self_signed(temp_dir.path()).unwrap();
        material.key_der = vec![1, 2, 3];

        assert!(server_config(&material).is_err());
    }
}
