//! Configuration for the ricochet interaction capture server.
//!
//! The process surface (domain, listen address, hostmaster, eviction,
//! auth/token, template, ACME, root-TLD and companion settings) is parsed by
//! the binary into a [`ServerConfig`], finalized once, and reduced to an
//! immutable [`SecurityPolicy`] for the auth gate.

pub mod policy;
pub mod server;
pub mod validate;

pub use policy::{AuthReason, SecurityPolicy};
pub use server::{
    AcmeSettings, CompanionConfig, CompanionMode, ListenerPorts, ServerConfig,
    LETS_ENCRYPT_PRODUCTION, LETS_ENCRYPT_STAGING,
};
pub use validate::{
    normalize_domain, ConfigError, PortRole, ValidationWarning, MAX_RENEW_BEFORE_DAYS,
};
