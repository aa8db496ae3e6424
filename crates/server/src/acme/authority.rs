//! Certificate authority seam.
//!
//! The coordinator drives issuance through these traits; [`super::AcmeClient`]
//! is the production implementation.

use async_trait::async_trait;

use super::error::AcmeError;

/// One DNS-01 challenge of an order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsChallenge {
    /// Challenge URL, used to signal readiness
    pub url: String,
    /// Value to serve as TXT at `_acme-challenge.<domain>`
    pub value: String,
}

/// Order state as reported by the authority
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderProgress {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid(String),
}

#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// Open an order covering `names`
    async fn new_order(&self, names: &[String]) -> Result<Box<dyn PendingOrder>, AcmeError>;
}

#[async_trait]
pub trait PendingOrder: Send {
    /// DNS-01 challenges still awaiting validation
    async fn dns_challenges(&mut self) -> Result<Vec<DnsChallenge>, AcmeError>;

    /// Tell the authority a challenge can be validated
    async fn set_ready(&mut self, challenge: &DnsChallenge) -> Result<(), AcmeError>;

    async fn refresh(&mut self) -> Result<OrderProgress, AcmeError>;

    async fn finalize(&mut self, csr_der: &[u8]) -> Result<(), AcmeError>;

    /// PEM chain once issued, `None` while still processing
    async fn certificate(&mut self) -> Result<Option<String>, AcmeError>;
}
