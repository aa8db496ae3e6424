//! Auth Gate
//!
//! Turns the startup [`SecurityPolicy`] into a concrete client token and
//! checks tokens presented by polling clients.

use ricochet_common::{AuthToken, CorrelationId};
use ricochet_config::SecurityPolicy;
use thiserror::Error;
use tracing::{debug, info};

use crate::store::{Store, StoreError};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("failed to generate client token: {0}")]
    TokenGeneration(#[from] rand::Error),

    #[error("unauthorized")]
    Unauthorized,
}

/// Origin of the active client token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    Supplied,
    Generated,
}

/// Immutable authentication gate.
///
/// When the policy makes authentication mandatory the gate holds exactly one
/// token for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct AuthGate {
    token: Option<AuthToken>,
    source: Option<TokenSource>,
}

impl AuthGate {
    /// Build the gate, generating a 256-bit token if one is required and
    /// none was supplied.
    pub fn from_policy(policy: &SecurityPolicy) -> Result<Self, AuthError> {
        if !policy.auth_required() {
            debug!("Authentication disabled");
            return Ok(Self::open());
        }

        let (token, source) = match policy.supplied_token().and_then(AuthToken::new) {
            Some(token) => (token, TokenSource::Supplied),
            None => (AuthToken::generate()?, TokenSource::Generated),
        };

        info!(
            reasons = ?policy.reasons(),
            source = ?source,
            "Authentication required"
        );

        Ok(Self {
            token: Some(token),
            source: Some(source),
        })
    }

    /// Gate that accepts every request
    pub fn open() -> Self {
        Self {
            token: None,
            source: None,
        }
    }

    pub fn required(&self) -> bool {
        self.token.is_some()
    }

    pub fn token(&self) -> Option<&AuthToken> {
        self.token.as_ref()
    }

    pub fn source(&self) -> Option<TokenSource> {
        self.source
    }

    /// Constant-time check; absent or empty tokens fail closed.
    pub fn verify(&self, supplied: Option<&str>) -> Result<(), AuthError> {
        match &self.token {
            None => Ok(()),
            Some(token) if token.matches(supplied) => Ok(()),
            Some(_) => Err(AuthError::Unauthorized),
        }
    }

    /// Bucket holding companion interactions, keyed by the token itself
    pub fn token_bucket(&self) -> Option<CorrelationId> {
        self.token
            .as_ref()
            .map(|t| CorrelationId::from_trusted(t.expose()))
    }

    /// Register the token bucket with the store
    pub fn install(&self, store: &Store) -> Result<(), StoreError> {
        if let (Some(id), Some(token)) = (self.token_bucket(), &self.token) {
            store.register_persistent(&id, Some(token.clone()))?;
            debug!("Registered token bucket");
        }
        Ok(())
    }
}
