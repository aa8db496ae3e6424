//! Type-safe identifier newtypes for ricochet.
//!
//! These types keep correlation ids (chosen by the client, embedded in
//! DNS labels, URLs and mail addresses) apart from the ids ricochet
//! generates for each captured interaction.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Maximum length of a single DNS label, and therefore of a correlation id.
pub const MAX_CORRELATION_ID_LEN: usize = 63;

/// Reasons a string is rejected as a correlation id.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidCorrelationId {
    #[error("correlation id is empty")]
    Empty,

    #[error("correlation id is {0} bytes (max: {MAX_CORRELATION_ID_LEN})")]
    TooLong(usize),

    #[error("correlation id contains invalid character {0:?}")]
    InvalidChar(char),
}

/// Client-chosen id binding captured interactions back to the client.
///
/// Always stored lowercased. Only `[a-z0-9-]` is accepted for ids coming
/// from the wire, so that the same id extracted from a DNS label, an HTTP
/// host or a mail address always compares equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Parse an id extracted from a protocol request.
    pub fn parse(s: &str) -> Result<Self, InvalidCorrelationId> {
        if s.is_empty() {
            return Err(InvalidCorrelationId::Empty);
        }
        if s.len() > MAX_CORRELATION_ID_LEN {
            return Err(InvalidCorrelationId::TooLong(s.len()));
        }
        let lowered = s.to_ascii_lowercase();
        if let Some(c) = lowered
            .chars()
            .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-'))
        {
            return Err(InvalidCorrelationId::InvalidChar(c));
        }
        Ok(Self(lowered))
    }

    /// Create from a trusted string without label validation.
    ///
    /// Used for ids ricochet registers itself: the bare domain in root-TLD
    /// mode and the client token bucket.
    pub fn from_trusted(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert to owned String
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for CorrelationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Unique id of one captured interaction.
///
/// Random (v4), so uniqueness holds across listeners without coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InteractionId(Uuid);

impl InteractionId {
    /// Create a new random interaction ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for InteractionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InteractionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
