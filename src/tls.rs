//! Server certificates for STARTTLS and implicit TLS

use crate::session::SessionInfo;
use crate::{Error, Result};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::rustls::pki_types::CertificateDer;
use tokio_rustls::rustls::ServerConfig;

/// Supplies the TLS configuration for a session about to upgrade
#[async_trait]
pub trait CertificateFactory: Send + Sync {
    async fn server_config(&self, session: &SessionInfo) -> Result<Arc<ServerConfig>>;
}

/// One certificate chain and key, loaded from PEM
#[derive(Debug, Clone)]
pub struct PemCertificateFactory {
    config: Arc<ServerConfig>,
}

impl PemCertificateFactory {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self { config }
    }

    /// Load TLS certificates
    pub async fn from_files(cert_file: impl AsRef<Path>, key_file: impl AsRef<Path>) -> Result<Self> {
        let cert_pem = tokio::fs::read(cert_file.as_ref()).await?;
        let key_pem = tokio::fs::read(key_file.as_ref()).await?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &cert_pem[..])
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| Error::Tls("Failed to parse certificate".into()))?;
        if certs.is_empty() {
            return Err(Error::Tls("No certificate found".into()));
        }

        let key = rustls_pemfile::private_key(&mut &key_pem[..])?
            .ok_or_else(|| Error::Tls("No private key found".into()))?;

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;

        Ok(Self::new(Arc::new(config)))
    }
}

#[async_trait]
impl CertificateFactory for PemCertificateFactory {
    async fn server_config(&self, _session: &SessionInfo) -> Result<Arc<ServerConfig>> {
        Ok(Arc::clone(&self.config))
    }
}
