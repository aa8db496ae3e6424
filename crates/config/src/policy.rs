//! Security policy derived from the feature flags.

use crate::server::{CompanionMode, ServerConfig};

/// Why authentication became mandatory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthReason {
    /// `--auth` given
    Requested,
    /// `--token` given
    ExplicitToken,
    /// Template upload enabled
    TemplateUpload,
    /// SMB or responder companion active
    Companion(CompanionMode),
    /// Root-TLD singleton bucket registered
    RootTld,
}

/// Immutable authentication policy, computed once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityPolicy {
    reasons: Vec<AuthReason>,
    supplied_token: Option<String>,
}

impl SecurityPolicy {
    pub fn from_config(config: &ServerConfig) -> Self {
        let supplied_token = config.token.clone().filter(|t| !t.is_empty());

        let mut reasons = Vec::new();
        if config.auth {
            reasons.push(AuthReason::Requested);
        }
        if supplied_token.is_some() {
            reasons.push(AuthReason::ExplicitToken);
        }
        if config.template {
            reasons.push(AuthReason::TemplateUpload);
        }
        if let Some(companion) = &config.companion {
            reasons.push(AuthReason::Companion(companion.mode));
        }
        if config.root_tld {
            reasons.push(AuthReason::RootTld);
        }

        Self {
            reasons,
            supplied_token,
        }
    }

    /// Policy with authentication disabled
    pub fn open() -> Self {
        Self {
            reasons: Vec::new(),
            supplied_token: None,
        }
    }

    pub fn auth_required(&self) -> bool {
        !self.reasons.is_empty()
    }

    pub fn reasons(&self) -> &[AuthReason] {
        &self.reasons
    }

    /// Operator-supplied token, if any
    pub fn supplied_token(&self) -> Option<&str> {
        self.supplied_token.as_deref()
    }
}
