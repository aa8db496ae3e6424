//! `instant-acme` backed certificate authority.

use std::sync::Arc;

use async_trait::async_trait;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus,
};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::authority::{CertificateAuthority, DnsChallenge, OrderProgress, PendingOrder};
use super::error::AcmeError;
use super::storage::CertificateStorage;

/// ACME client for one directory, with persisted account credentials
pub struct AcmeClient {
    directory: String,
    contact: String,
    storage: Arc<CertificateStorage>,
    account: OnceCell<Account>,
}

impl AcmeClient {
    pub fn new(
        directory: impl Into<String>,
        contact_email: &str,
        storage: Arc<CertificateStorage>,
    ) -> Self {
        Self {
            directory: directory.into(),
            contact: format!("mailto:{}", contact_email),
            storage,
            account: OnceCell::new(),
        }
    }

    pub fn directory(&self) -> &str {
        &self.directory
    }

    async fn account(&self) -> Result<&Account, AcmeError> {
        self.account.get_or_try_init(|| self.load_or_register()).await
    }

    /// Load the stored account or register a new one
    async fn load_or_register(&self) -> Result<Account, AcmeError> {
        if let Some(json) = self.storage.load_credentials_json()? {
            let credentials: AccountCredentials =
                serde_json::from_str(&json).map_err(|e| AcmeError::Account(e.to_string()))?;
            let account = Account::from_credentials(credentials).await?;
            debug!(directory = %self.directory, "Restored ACME account");
            return Ok(account);
        }

        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &[self.contact.as_str()],
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &self.directory,
            None,
        )
        .await?;

        let json =
            serde_json::to_string(&credentials).map_err(|e| AcmeError::Account(e.to_string()))?;
        self.storage.save_credentials_json(&json)?;
        info!(directory = %self.directory, "Registered ACME account");
        Ok(account)
    }
}

impl std::fmt::Debug for AcmeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcmeClient")
            .field("directory", &self.directory)
            .field("has_account", &self.account.initialized())
            .finish()
    }
}

#[async_trait]
impl CertificateAuthority for AcmeClient {
    async fn new_order(&self, names: &[String]) -> Result<Box<dyn PendingOrder>, AcmeError> {
        let account = self.account().await?;
        let identifiers: Vec<Identifier> = names.iter().cloned().map(Identifier::Dns).collect();
        let order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .map_err(|e| AcmeError::OrderCreation(e.to_string()))?;

        debug!(names = ?names, "Created ACME order");
        Ok(Box::new(AcmeOrder { order }))
    }
}

struct AcmeOrder {
    order: Order,
}

#[async_trait]
impl PendingOrder for AcmeOrder {
    async fn dns_challenges(&mut self) -> Result<Vec<DnsChallenge>, AcmeError> {
        let authorizations = self.order.authorizations().await?;
        let mut challenges = Vec::new();

        for authz in &authorizations {
            match authz.status {
                AuthorizationStatus::Pending => {}
                AuthorizationStatus::Valid => continue,
                status => {
                    return Err(AcmeError::ChallengeValidation(format!(
                        "authorization is {:?}",
                        status
                    )))
                }
            }

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Dns01)
                .ok_or_else(|| AcmeError::NoDnsChallenge(format!("{:?}", authz.identifier)))?;

            challenges.push(DnsChallenge {
                url: challenge.url.clone(),
                value: self.order.key_authorization(challenge).dns_value(),
            });
        }
        Ok(challenges)
    }

    async fn set_ready(&mut self, challenge: &DnsChallenge) -> Result<(), AcmeError> {
        self.order.set_challenge_ready(&challenge.url).await?;
        Ok(())
    }

    async fn refresh(&mut self) -> Result<OrderProgress, AcmeError> {
        let state = self.order.refresh().await?;
        Ok(match state.status {
            OrderStatus::Pending => OrderProgress::Pending,
            OrderStatus::Ready => OrderProgress::Ready,
            OrderStatus::Processing => OrderProgress::Processing,
            OrderStatus::Valid => OrderProgress::Valid,
            OrderStatus::Invalid => OrderProgress::Invalid(
                state
                    .error
                    .as_ref()
                    .map(|p| format!("{:?}", p))
                    .unwrap_or_else(|| "order invalid".to_string()),
            ),
        })
    }

    async fn finalize(&mut self, csr_der: &[u8]) -> Result<(), AcmeError> {
        self.order
            .finalize(csr_der)
            .await
            .map_err(|e| AcmeError::Finalization(e.to_string()))
    }

    async fn certificate(&mut self) -> Result<Option<String>, AcmeError> {
        Ok(self.order.certificate().await?)
    }
}
