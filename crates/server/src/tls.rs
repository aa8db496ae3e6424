//! TLS termination with hot-reloadable certificate material.
//!
//! HTTP and SMTP listeners share one [`CertificateResolver`]. Installing a
//! new certificate swaps it atomically: handshakes that already resolved a
//! key keep it, new handshakes pick up the replacement.

use std::io::BufReader;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use rustls::crypto::aws_lc_rs;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("no certificates found in PEM input")]
    NoCertificates,

    #[error("no private key found in PEM input")]
    NoPrivateKey,

    #[error("failed to read PEM: {0}")]
    Pem(#[from] std::io::Error),

    #[error("unsupported private key: {0}")]
    Key(rustls::Error),

    #[error("failed to parse certificate: {0}")]
    Parse(String),

    #[error("TLS configuration error: {0}")]
    Config(#[from] rustls::Error),
}

/// Parsed certificate chain and signing key
#[derive(Debug, Clone)]
pub struct CertificateBundle {
    key: Arc<CertifiedKey>,
    not_after: DateTime<Utc>,
}

impl CertificateBundle {
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, TlsError> {
        let certs: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut BufReader::new(cert_pem.as_bytes()))
                .collect::<Result<_, _>>()?;
        let leaf = certs.first().ok_or(TlsError::NoCertificates)?;
        let not_after = not_after(leaf)?;

        let key: PrivateKeyDer<'static> =
            rustls_pemfile::private_key(&mut BufReader::new(key_pem.as_bytes()))?
                .ok_or(TlsError::NoPrivateKey)?;
        let signing_key = aws_lc_rs::sign::any_supported_type(&key).map_err(TlsError::Key)?;

        Ok(Self {
            key: Arc::new(CertifiedKey::new(certs, signing_key)),
            not_after,
        })
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }
}

/// Expiry of a DER certificate
pub fn not_after(cert: &CertificateDer<'_>) -> Result<DateTime<Utc>, TlsError> {
    let (_, parsed) = x509_parser::parse_x509_certificate(cert.as_ref())
        .map_err(|e| TlsError::Parse(e.to_string()))?;
    let timestamp = parsed.validity().not_after.timestamp();
    DateTime::from_timestamp(timestamp, 0)
        .ok_or_else(|| TlsError::Parse(format!("timestamp out of range: {}", timestamp)))
}

/// Certificate resolver whose material can be replaced at runtime
#[derive(Debug, Default)]
pub struct CertificateResolver {
    current: ArcSwapOption<CertificateBundle>,
}

impl CertificateResolver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Replace the served certificate
    pub fn install(&self, bundle: CertificateBundle) {
        info!(not_after = %bundle.not_after, "Installed TLS certificate");
        self.current.store(Some(Arc::new(bundle)));
    }

    pub fn is_ready(&self) -> bool {
        self.current.load().is_some()
    }

    pub fn not_after(&self) -> Option<DateTime<Utc>> {
        self.current.load().as_ref().map(|b| b.not_after)
    }
}

impl ResolvesServerCert for CertificateResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let key = self.current.load().as_ref().map(|b| Arc::clone(&b.key));
        if key.is_none() {
            debug!(sni = ?client_hello.server_name(), "TLS handshake without certificate");
        }
        key
    }
}

/// Server config backed by the resolver
pub fn server_config(
    resolver: Arc<CertificateResolver>,
    alpn: &[&[u8]],
) -> Result<Arc<rustls::ServerConfig>, TlsError> {
    let mut config =
        rustls::ServerConfig::builder_with_provider(Arc::new(aws_lc_rs::default_provider()))
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_cert_resolver(resolver);
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Ok(Arc::new(config))
}
