//! TLS client configuration for proxy connections

use crate::{TunnelError, TunnelResult};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Caller-supplied TLS settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsOptions {
    /// Skip server certificate verification (INSECURE)
    #[serde(default)]
    pub insecure_skip_verify: bool,

    /// PEM bundle replacing the built-in web PKI roots
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,

    /// PEM client certificate chain for mutual TLS
    #[serde(default)]
    pub client_cert_path: Option<PathBuf>,

    /// PEM private key matching `client_cert_path`
    #[serde(default)]
    pub client_key_path: Option<PathBuf>,
}

impl TlsOptions {
    /// Disable server certificate verification (INSECURE)
    pub fn with_insecure_skip_verify(mut self) -> Self {
        self.insecure_skip_verify = true;
        self
    }

    pub fn with_ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self
    }

    pub fn with_client_cert(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.client_cert_path = Some(cert.into());
        self.client_key_path = Some(key.into());
        self
    }

    /// Build a rustls client config without ALPN; tunnelers add their own.
    pub fn build_client_config(&self) -> TunnelResult<Arc<rustls::ClientConfig>> {
        ensure_crypto_provider();

        let builder = if self.insecure_skip_verify {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(SkipVerification::new())
        } else {
            let mut roots = rustls::RootCertStore::empty();
            match &self.ca_cert_path {
                Some(path) => {
                    for cert in load_certs(path)? {
                        roots.add(cert).map_err(|e| {
                            TunnelError::ConfigurationError(format!("Invalid root cert: {}", e))
                        })?;
                    }
                }
                None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
            }
            rustls::ClientConfig::builder().with_root_certificates(roots)
        };

        let config = match (&self.client_cert_path, &self.client_key_path) {
            (Some(cert), Some(key)) => builder
                .with_client_auth_cert(load_certs(cert)?, load_private_key(key)?)
                .map_err(|e| TunnelError::TlsError(format!("Invalid client cert/key: {}", e)))?,
            (None, None) => builder.with_no_client_auth(),
            _ => {
                return Err(TunnelError::ConfigurationError(
                    "client certificate and key must be set together".to_string(),
                ))
            }
        };

        Ok(Arc::new(config))
    }
}

/// Copy of `config` advertising exactly `protocols` via ALPN
pub fn with_alpn(config: &rustls::ClientConfig, protocols: &[&[u8]]) -> Arc<rustls::ClientConfig> {
    let mut config = config.clone();
    config.alpn_protocols = protocols.iter().map(|p| p.to_vec()).collect();
    Arc::new(config)
}

// Initialize rustls crypto provider
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

pub fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

fn load_certs(path: &Path) -> TunnelResult<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| TunnelError::TlsError(format!("Failed to open cert file: {}", e)))?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TunnelError::TlsError(format!("Failed to parse certs: {}", e)))?;

    if certs.is_empty() {
        return Err(TunnelError::TlsError(format!(
            "No certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> TunnelResult<rustls::pki_types::PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| TunnelError::TlsError(format!("Failed to open key file: {}", e)))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TunnelError::TlsError(format!("Failed to parse key: {}", e)))?
        .ok_or_else(|| TunnelError::TlsError("No private key found".to_string()))
}

// Certificate verifier that accepts any server certificate
#[derive(Debug)]
struct SkipVerification {
    schemes: Vec<rustls::SignatureScheme>,
}

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            schemes: rustls::crypto::ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes(),
        })
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.schemes.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_uses_webpki_roots() {
        let config = TlsOptions::default().build_client_config().unwrap();
        assert!(config.alpn_protocols.is_empty());
    }

    #[test]
    fn test_insecure_config() {
        let config = TlsOptions::default()
            .with_insecure_skip_verify()
            .build_client_config()
            .unwrap();
        let h2 = with_alpn(&config, &[b"h2"]);
        assert_eq!(h2.alpn_protocols, vec![b"h2".to_vec()]);
        assert!(config.alpn_protocols.is_empty());
    }

    #[test]
    fn test_client_cert_requires_key() {
        let options = TlsOptions {
            client_cert_path: Some(PathBuf::from("/nonexistent/cert.pem")),
            ..Default::default()
        };
        assert!(matches!(
            options.build_client_config(),
            Err(TunnelError::ConfigurationError(_))
        ));
    }

    #[test]
    fn test_missing_ca_file() {
        let options = TlsOptions::default().with_ca_cert("/nonexistent/ca.pem");
        assert!(matches!(
            options.build_client_config(),
            Err(TunnelError::TlsError(_))
        ));
    }
}
