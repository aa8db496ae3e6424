//! Captured interaction records.
//!
//! An [`InteractionRecord`] is created by a protocol listener the moment a
//! request is decoded and is never mutated afterwards. It serializes to the
//! JSON shape returned to polling clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

use crate::ids::{CorrelationId, InteractionId};

/// Wire protocol an interaction arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Dns,
    Http,
    Smtp,
    Smb,
    Responder,
}

impl Protocol {
    /// Lowercase name, used as a metrics label
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Dns => "dns",
            Protocol::Http => "http",
            Protocol::Smtp => "smtp",
            Protocol::Smb => "smb",
            Protocol::Responder => "responder",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol-specific metadata kept alongside the raw transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProtocolDetails {
    Dns {
        /// Query type mnemonic (`A`, `TXT`, ...)
        #[serde(rename = "q-type")]
        query_type: String,
    },
    Http {
        method: String,
        path: String,
    },
    Smtp {
        #[serde(rename = "smtp-from")]
        mail_from: String,
    },
    None,
}

/// One captured event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct InteractionRecord {
    pub protocol: Protocol,
    pub correlation_id: CorrelationId,
    pub unique_id: InteractionId,
    /// Full name the id was extracted from (query name, host, recipient)
    pub full_id: String,
    pub remote_address: String,
    pub timestamp: DateTime<Utc>,
    pub raw_request: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub raw_response: String,
    pub details: ProtocolDetails,
}

impl InteractionRecord {
    /// Start a record for `correlation_id`, stamped with the current time.
    pub fn new(protocol: Protocol, correlation_id: CorrelationId, remote: SocketAddr) -> Self {
        Self {
            protocol,
            full_id: correlation_id.to_string(),
            correlation_id,
            unique_id: InteractionId::new(),
            remote_address: remote.ip().to_string(),
            timestamp: Utc::now(),
            raw_request: String::new(),
            raw_response: String::new(),
            details: ProtocolDetails::None,
        }
    }

    pub fn with_full_id(mut self, full_id: impl Into<String>) -> Self {
        self.full_id = full_id.into();
        self
    }

    pub fn with_raw_request(mut self, raw: impl Into<String>) -> Self {
        self.raw_request = raw.into();
        self
    }

    pub fn with_raw_response(mut self, raw: impl Into<String>) -> Self {
        self.raw_response = raw.into();
        self
    }

    pub fn with_details(mut self, details: ProtocolDetails) -> Self {
        self.details = details;
        self
    }

    /// Copy of this record filed under a different bucket.
    ///
    /// Gets a fresh unique id; the timestamp and transcript are preserved.
    pub fn refiled(&self, correlation_id: CorrelationId) -> Self {
        Self {
            correlation_id,
            unique_id: InteractionId::new(),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote() -> SocketAddr {
        "192.0.2.10:53000".parse().unwrap()
    }

    #[test]
    fn test_record_serializes_kebab_case() {
        let record = InteractionRecord::new(
            Protocol::Dns,
            CorrelationId::parse("abc123").unwrap(),
            remote(),
        )
        .with_full_id("abc123.example.com")
        .with_details(ProtocolDetails::Dns {
            query_type: "A".to_string(),
        });

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["protocol"], "dns");
        assert_eq!(json["correlation-id"], "abc123");
        assert_eq!(json["full-id"], "abc123.example.com");
        assert_eq!(json["remote-address"], "192.0.2.10");
        assert_eq!(json["details"]["q-type"], "A");
        assert!(json.get("raw-response").is_none());
    }

    #[test]
    fn test_refiled_gets_new_unique_id() {
        let record = InteractionRecord::new(
            Protocol::Smb,
            CorrelationId::parse("abc123").unwrap(),
            remote(),
        );
        let moved = record.refiled(CorrelationId::from_trusted("token-bucket"));

        assert_eq!(moved.correlation_id.as_str(), "token-bucket");
        assert_ne!(moved.unique_id, record.unique_id);
        assert_eq!(moved.timestamp, record.timestamp);
    }
}
