//! Client authentication tokens.

use rand::RngCore;
use std::fmt;
use subtle::ConstantTimeEq;

/// Bytes of entropy in a generated token (256 bits).
pub const TOKEN_ENTROPY_BYTES: usize = 32;

/// Secret a client must present to read interactions.
///
/// Comparison is constant-time and `Debug` never prints the value.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    /// Wrap an operator- or client-supplied token.
    ///
    /// Returns `None` for an empty string, which is never a valid token.
    pub fn new(value: impl Into<String>) -> Option<Self> {
        let value = value.into();
        if value.is_empty() {
            None
        } else {
            Some(Self(value))
        }
    }

    /// Generate a random hex token from the OS CSPRNG.
    pub fn generate() -> Result<Self, rand::Error> {
        let mut bytes = [0u8; TOKEN_ENTROPY_BYTES];
        rand::rngs::OsRng.try_fill_bytes(&mut bytes)?;
        Ok(Self(hex::encode(bytes)))
    }

    /// Constant-time check of a supplied value against this token.
    ///
    /// Absent and empty values never match.
    pub fn matches(&self, supplied: Option<&str>) -> bool {
        match supplied {
            Some(s) if !s.is_empty() => self.0.as_bytes().ct_eq(s.as_bytes()).into(),
            _ => false,
        }
    }

    /// The raw token value, for printing once to the operator.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken(<redacted>)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_token_has_256_bits() {
        let token = AuthToken::generate().unwrap();
        assert_eq!(token.expose().len(), TOKEN_ENTROPY_BYTES * 2);
        assert!(token.expose().chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(token, AuthToken::generate().unwrap());
    }

    #[test]
    fn test_matches_fails_closed() {
        let token = AuthToken::new("s3cret").unwrap();
        assert!(token.matches(Some("s3cret")));
        assert!(!token.matches(Some("s3cre")));
        assert!(!token.matches(Some("")));
        assert!(!token.matches(None));
    }

    #[test]
    fn test_empty_token_rejected() {
        assert!(AuthToken::new("").is_none());
    }

    #[test]
    fn test_debug_redacts() {
        let token = AuthToken::new("s3cret").unwrap();
        assert!(!format!("{:?}", token).contains("s3cret"));
    }
}
