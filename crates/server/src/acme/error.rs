//! ACME error types

use std::time::Duration;

use thiserror::Error;

use crate::tls::TlsError;

/// Errors from certificate storage
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from certificate issuance
#[derive(Debug, Error)]
pub enum AcmeError {
    #[error("ACME account error: {0}")]
    Account(String),

    #[error("failed to create order: {0}")]
    OrderCreation(String),

    #[error("no DNS-01 challenge offered for {0}")]
    NoDnsChallenge(String),

    #[error("challenge validation failed: {0}")]
    ChallengeValidation(String),

    #[error("timed out after {0:?} waiting for {1}")]
    Timeout(Duration, &'static str),

    #[error("failed to finalize order: {0}")]
    Finalization(String),

    #[error("CSR generation failed: {0}")]
    Csr(String),

    #[error("issuance already in progress")]
    InProgress,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("ACME protocol error: {0}")]
    Protocol(#[from] instant_acme::Error),
}
