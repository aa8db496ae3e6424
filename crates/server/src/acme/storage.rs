//! On-disk certificate and account storage.
//!
//! ```text
//! storage/
//! ├── credentials.json      # instant-acme account credentials
//! └── certs/
//!     └── example.com/
//!         ├── cert.pem      # chain, leaf first
//!         ├── key.pem       # 0600
//!         └── meta.json
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use super::error::StorageError;
use crate::tls::{CertificateBundle, TlsError};

const CREDENTIALS_FILE: &str = "credentials.json";
const CERTS_DIR: &str = "certs";

/// Metadata written next to each certificate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateMeta {
    pub expires: DateTime<Utc>,
    pub issued: DateTime<Utc>,
    /// Names on the certificate (wildcard and apex)
    pub names: Vec<String>,
    pub directory: String,
}

#[derive(Debug, Clone)]
pub struct StoredCertificate {
    pub cert_pem: String,
    pub key_pem: String,
    pub meta: CertificateMeta,
}

impl StoredCertificate {
    /// Whether the certificate expires within `days`
    pub fn expires_within(&self, days: u32, now: DateTime<Utc>) -> bool {
        self.meta.expires <= now + chrono::Duration::days(i64::from(days))
    }

    pub fn bundle(&self) -> Result<CertificateBundle, TlsError> {
        CertificateBundle::from_pem(&self.cert_pem, &self.key_pem)
    }
}

/// Filesystem storage with owner-only permissions
#[derive(Debug)]
pub struct CertificateStorage {
    base_path: PathBuf,
}

impl CertificateStorage {
    /// Open (creating if needed) storage rooted at `base_path`
    pub fn new(base_path: &Path) -> Result<Self, StorageError> {
        let certs = base_path.join(CERTS_DIR);
        fs::create_dir_all(&certs)?;
        restrict(base_path, 0o700)?;
        restrict(&certs, 0o700)?;

        debug!(storage_path = %base_path.display(), "Opened certificate storage");
        Ok(Self {
            base_path: base_path.to_path_buf(),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Raw `instant_acme::AccountCredentials` JSON
    pub fn load_credentials_json(&self) -> Result<Option<String>, StorageError> {
        let path = self.base_path.join(CREDENTIALS_FILE);
        if !path.exists() {
            trace!("No stored ACME credentials");
            return Ok(None);
        }
        Ok(Some(fs::read_to_string(path)?))
    }

    pub fn save_credentials_json(&self, json: &str) -> Result<(), StorageError> {
        write_private(&self.base_path.join(CREDENTIALS_FILE), json)?;
        info!("Saved ACME account credentials");
        Ok(())
    }

    fn domain_path(&self, domain: &str) -> PathBuf {
        self.base_path
            .join(CERTS_DIR)
            .join(domain.trim_start_matches("*."))
    }

    pub fn load_certificate(&self, domain: &str) -> Result<Option<StoredCertificate>, StorageError> {
        let dir = self.domain_path(domain);
        let cert_path = dir.join("cert.pem");
        if !cert_path.exists() {
            trace!(domain = %domain, "No stored certificate");
            return Ok(None);
        }

        let meta: CertificateMeta =
            serde_json::from_str(&fs::read_to_string(dir.join("meta.json"))?)?;
        let stored = StoredCertificate {
            cert_pem: fs::read_to_string(cert_path)?,
            key_pem: fs::read_to_string(dir.join("key.pem"))?,
            meta,
        };

        debug!(domain = %domain, expires = %stored.meta.expires, "Loaded stored certificate");
        Ok(Some(stored))
    }

    pub fn save_certificate(
        &self,
        domain: &str,
        cert_pem: &str,
        key_pem: &str,
        meta: &CertificateMeta,
    ) -> Result<(), StorageError> {
        let dir = self.domain_path(domain);
        fs::create_dir_all(&dir)?;

        // Key first so a crash never leaves a certificate without its key
        write_private(&dir.join("key.pem"), key_pem)?;
        fs::write(dir.join("cert.pem"), cert_pem)?;
        fs::write(dir.join("meta.json"), serde_json::to_string_pretty(meta)?)?;

        info!(domain = %domain, expires = %meta.expires, "Saved certificate");
        Ok(())
    }

    /// True when no certificate is stored or it expires within `days`
    pub fn needs_renewal(&self, domain: &str, days: u32) -> Result<bool, StorageError> {
        Ok(match self.load_certificate(domain)? {
            Some(cert) => cert.expires_within(days, Utc::now()),
            None => true,
        })
    }
}

fn write_private(path: &Path, contents: &str) -> Result<(), StorageError> {
    fs::write(path, contents)?;
    restrict(path, 0o600)
}

#[cfg(unix)]
fn restrict(path: &Path, mode: u32) -> Result<(), StorageError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict(_path: &Path, _mode: u32) -> Result<(), StorageError> {
    Ok(())
}
