//! Server configuration types.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Seconds per eviction unit (one day)
const SECONDS_PER_DAY: u64 = 86_400;

/// Complete process configuration.
///
/// Built once at startup (from the CLI) and handed to the components at
/// construction time. Nothing reads it afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Zone the server is authoritative for, e.g. `oast.example.com`
    pub domain: String,

    /// Address returned in `A` answers
    #[serde(default)]
    pub public_ip: Option<IpAddr>,

    /// Address every listener binds to
    #[serde(default = "default_listen_ip")]
    pub listen_ip: IpAddr,

    /// Hostmaster email, used for the SOA record and the ACME account
    #[serde(default)]
    pub hostmaster: String,

    /// Days an idle correlation bucket is retained
    #[serde(default = "default_eviction_days")]
    pub eviction_days: u64,

    /// Require a token to read interactions
    #[serde(default)]
    pub auth: bool,

    /// Operator-chosen client token
    #[serde(default)]
    pub token: Option<String>,

    /// Client template upload enabled
    #[serde(default)]
    pub template: bool,

    /// Serve `*.domain.tld` interactions against the bare domain
    #[serde(default)]
    pub root_tld: bool,

    /// Value of `Access-Control-Allow-Origin` on API responses
    #[serde(default = "default_origin_url")]
    pub origin_url: String,

    /// SMB or responder companion whose log is ingested
    #[serde(default)]
    pub companion: Option<CompanionConfig>,

    #[serde(default)]
    pub ports: ListenerPorts,

    #[serde(default)]
    pub acme: AcmeSettings,
}

impl ServerConfig {
    /// Configuration for `domain` with every other setting at its default.
    pub fn for_domain(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            public_ip: None,
            listen_ip: default_listen_ip(),
            hostmaster: String::new(),
            eviction_days: default_eviction_days(),
            auth: false,
            token: None,
            template: false,
            root_tld: false,
            origin_url: default_origin_url(),
            companion: None,
            ports: ListenerPorts::default(),
            acme: AcmeSettings::default(),
        }
    }

    /// Retention window for idle buckets
    pub fn eviction(&self) -> Duration {
        Duration::from_secs(self.eviction_days.saturating_mul(SECONDS_PER_DAY))
    }

    /// Socket address for a listener port on the configured listen IP
    pub fn listen_addr(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.listen_ip, port)
    }

    /// Domain and wildcard covered by the certificate, wildcard first
    pub fn certificate_domains(&self) -> Vec<String> {
        vec![format!("*.{}", self.domain), self.domain.clone()]
    }
}

fn default_listen_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_eviction_days() -> u64 {
    7
}

fn default_origin_url() -> String {
    "https://interact.example.org".to_string()
}

/// Listener ports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerPorts {
    pub dns: u16,
    pub http: u16,
    pub https: u16,
    pub smtp: u16,
    pub smtps: u16,
}

impl Default for ListenerPorts {
    fn default() -> Self {
        Self {
            dns: 53,
            http: 80,
            https: 443,
            smtp: 25,
            smtps: 465,
        }
    }
}

/// Which companion agent feeds interactions into the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompanionMode {
    Smb,
    Responder,
}

/// Companion agent output to ingest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanionConfig {
    pub mode: CompanionMode,
    /// Log file the agent appends captured events to
    pub log_path: PathBuf,
}

/// Let's Encrypt production directory
pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Let's Encrypt staging directory
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Automatic certificate provisioning settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcmeSettings {
    /// Request a certificate at startup (cleared by `--skip-acme`)
    pub enabled: bool,

    /// ACME directory URL; defaults to Let's Encrypt (staging if `staging`)
    #[serde(default)]
    pub directory_url: Option<String>,

    #[serde(default)]
    pub staging: bool,

    /// Where account credentials and issued certificates are kept
    pub storage_path: PathBuf,

    /// Renew when the certificate expires within this many days
    pub renew_before_days: u32,

    /// Upper bound on waiting for the authority to validate a challenge
    pub validation_timeout_secs: u64,
}

impl AcmeSettings {
    /// Directory URL after applying the staging default
    pub fn directory(&self) -> &str {
        match &self.directory_url {
            Some(url) => url,
            None if self.staging => LETS_ENCRYPT_STAGING,
            None => LETS_ENCRYPT_PRODUCTION,
        }
    }

    pub fn validation_timeout(&self) -> Duration {
        Duration::from_secs(self.validation_timeout_secs)
    }
}

impl Default for AcmeSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            directory_url: None,
            staging: false,
            storage_path: PathBuf::from("/var/lib/ricochet/acme"),
            renew_before_days: 30,
            validation_timeout_secs: 120,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eviction_in_days() {
        let mut config = ServerConfig::for_domain("example.com");
        assert_eq!(config.eviction(), Duration::from_secs(7 * 86_400));

        config.eviction_days = 1;
        assert_eq!(config.eviction(), Duration::from_secs(86_400));
    }

    #[test]
    fn test_certificate_domains() {
        let config = ServerConfig::for_domain("example.com");
        assert_eq!(
            config.certificate_domains(),
            vec!["*.example.com".to_string(), "example.com".to_string()]
        );
    }

    #[test]
    fn test_acme_directory_defaults() {
        let mut acme = AcmeSettings::default();
        assert_eq!(acme.directory(), LETS_ENCRYPT_PRODUCTION);

        acme.staging = true;
        assert_eq!(acme.directory(), LETS_ENCRYPT_STAGING);

        acme.directory_url = Some("https://ca.internal/directory".to_string());
        assert_eq!(acme.directory(), "https://ca.internal/directory");
    }

    #[test]
    fn test_deserialize_minimal() {
        let config: ServerConfig = serde_json::from_str(
            r#"{
                "domain": "example.com",
                "acme": {
                    "enabled": false,
                    "storage_path": "/tmp/acme",
                    "renew_before_days": 30,
                    "validation_timeout_secs": 60
                }
            }"#,
        )
        .unwrap();

        assert_eq!(config.eviction_days, 7);
        assert_eq!(config.ports.dns, 53);
        assert!(!config.acme.enabled);
    }
}
