//! Configuration validation
//!
//! Normalizes the user-facing settings and rejects deployments that cannot
//! work. Problems that only degrade the server are reported as warnings.

mod network;

use thiserror::Error;
use tracing::{debug, trace};

use crate::server::ServerConfig;

pub use network::{validate_ports, PortRole};

/// Fatal configuration errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("domain must not be empty")]
    MissingDomain,

    #[error("invalid domain {0:?}: {1}")]
    InvalidDomain(String, &'static str),

    #[error("public IP address (--ip) is required to answer DNS queries")]
    MissingPublicIp,

    #[error("eviction must be at least one day")]
    EvictionTooShort,

    #[error("invalid hostmaster email {0:?}")]
    InvalidHostmaster(String),

    #[error("responder and smb can't be active at the same time")]
    ConflictingCompanions,

    #[error("{first:?} and {second:?} listeners both use port {port}")]
    PortConflict {
        first: PortRole,
        second: PortRole,
        port: u16,
    },

    #[error("invalid origin URL {0:?}")]
    InvalidOriginUrl(String),

    #[error("renewal window of {0} days is outside 1..={MAX_RENEW_BEFORE_DAYS}")]
    RenewalWindow(u32),
}

/// Certificates from the default authority live 90 days
pub const MAX_RENEW_BEFORE_DAYS: u32 = 89;

/// Non-fatal configuration finding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationWarning {
    pub message: String,
}

impl ValidationWarning {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl ServerConfig {
    /// Normalize and validate, producing the configuration the server runs with.
    ///
    /// - domain lowercased, trailing dot removed
    /// - hostmaster defaults to `admin@<domain>`
    pub fn finalize(mut self) -> Result<Self, ConfigError> {
        trace!(domain = %self.domain, "Validating configuration");

        self.domain = normalize_domain(&self.domain)?;

        if self.hostmaster.is_empty() {
            self.hostmaster = format!("admin@{}", self.domain);
            debug!(hostmaster = %self.hostmaster, "Defaulted hostmaster email");
        }
        if !is_plausible_email(&self.hostmaster) {
            return Err(ConfigError::InvalidHostmaster(self.hostmaster));
        }

        if self.public_ip.is_none() {
            return Err(ConfigError::MissingPublicIp);
        }

        if self.eviction_days == 0 {
            return Err(ConfigError::EvictionTooShort);
        }

        if url::Url::parse(&self.origin_url).is_err() {
            return Err(ConfigError::InvalidOriginUrl(self.origin_url));
        }

        let window = self.acme.renew_before_days;
        if !(1..=MAX_RENEW_BEFORE_DAYS).contains(&window) {
            return Err(ConfigError::RenewalWindow(window));
        }

        validate_ports(&self.ports)?;

        Ok(self)
    }

    /// Findings that do not prevent startup
    pub fn warnings(&self) -> Vec<ValidationWarning> {
        let mut warnings = Vec::new();

        if !self.acme.enabled {
            warnings.push(ValidationWarning::new(
                "ACME disabled, HTTPS and SMTPS serve only a previously stored certificate",
            ));
        } else if self.acme.staging {
            warnings.push(ValidationWarning::new(
                "ACME staging directory in use, certificates will not be trusted by clients",
            ));
        }

        if self.template && self.token.is_none() {
            warnings.push(ValidationWarning::new(
                "template upload enabled without --token, a random token will be generated",
            ));
        }

        warnings
    }
}

/// Lowercase a domain and strip the trailing root dot.
pub fn normalize_domain(domain: &str) -> Result<String, ConfigError> {
    let trimmed = domain.trim().trim_end_matches('.').to_ascii_lowercase();
    if trimmed.is_empty() {
        return Err(ConfigError::MissingDomain);
    }
    if trimmed.len() > 253 {
        return Err(ConfigError::InvalidDomain(trimmed, "longer than 253 bytes"));
    }
    for label in trimmed.split('.') {
        if label.is_empty() {
            return Err(ConfigError::InvalidDomain(trimmed, "empty label"));
        }
        if label.len() > 63 {
            return Err(ConfigError::InvalidDomain(trimmed, "label longer than 63 bytes"));
        }
        if !label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(ConfigError::InvalidDomain(trimmed, "invalid character"));
        }
    }
    Ok(trimmed)
}

fn is_plausible_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, host)) => !local.is_empty() && !host.is_empty() && !host.contains('@'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{CompanionConfig, CompanionMode};
    use std::net::IpAddr;
    use std::path::PathBuf;

    fn valid() -> ServerConfig {
        let mut config = ServerConfig::for_domain("OAST.Example.com.");
        config.public_ip = Some("203.0.113.7".parse::<IpAddr>().unwrap());
        config
    }

    #[test]
    fn test_finalize_normalizes() {
        let config = valid().finalize().unwrap();
        assert_eq!(config.domain, "oast.example.com");
        assert_eq!(config.hostmaster, "admin@oast.example.com");
    }

    #[test]
    fn test_explicit_hostmaster_kept() {
        let mut config = valid();
        config.hostmaster = "dns@example.net".to_string();
        assert_eq!(config.finalize().unwrap().hostmaster, "dns@example.net");
    }

    #[test]
    fn test_missing_ip_rejected() {
        let mut config = valid();
        config.public_ip = None;
        assert_eq!(config.finalize().unwrap_err(), ConfigError::MissingPublicIp);
    }

    #[test]
    fn test_bad_domains_rejected() {
        for domain in ["", ".", "a..b", "exa mple.com", "under_score.com"] {
            let mut config = valid();
            config.domain = domain.to_string();
            assert!(config.finalize().is_err(), "accepted {:?}", domain);
        }
    }

    #[test]
    fn test_zero_eviction_rejected() {
        let mut config = valid();
        config.eviction_days = 0;
        assert_eq!(config.finalize().unwrap_err(), ConfigError::EvictionTooShort);
    }

    #[test]
    fn test_bad_hostmaster_rejected() {
        let mut config = valid();
        config.hostmaster = "nobody".to_string();
        assert!(matches!(
            config.finalize(),
            Err(ConfigError::InvalidHostmaster(_))
        ));
    }

    #[test]
    fn test_companion_accepted() {
        let mut config = valid();
        config.companion = Some(CompanionConfig {
            mode: CompanionMode::Responder,
            log_path: PathBuf::from("/tmp/responder.log"),
        });
        assert!(config.finalize().is_ok());
    }

    #[test]
    fn test_renewal_window_bounded() {
        for days in [0, MAX_RENEW_BEFORE_DAYS + 1, 100_000_000] {
            let mut config = valid();
            config.acme.renew_before_days = days;
            assert_eq!(
                config.finalize().unwrap_err(),
                ConfigError::RenewalWindow(days)
            );
        }

        let mut config = valid();
        config.acme.renew_before_days = MAX_RENEW_BEFORE_DAYS;
        assert!(config.finalize().is_ok());
    }

    #[test]
    fn test_warnings() {
        let mut config = valid();
        config.acme.enabled = false;
        config.template = true;

        let warnings = config.warnings();
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].message.contains("ACME disabled"));
    }
}
