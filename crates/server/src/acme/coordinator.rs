//! ACME Coordinator
//!
//! Drives one DNS-01 issuance at a time:
//!
//! ```text
//! Idle → Requested → ChallengePublished → Validating → Issued | Failed
//! ```
//!
//! The coordinator never touches the DNS listener directly; it only holds a
//! [`ChallengePublisher`] over the listener's TXT cell. Issued material is
//! handed to the shared [`CertificateResolver`], so HTTPS and SMTPS pick it
//! up on their next handshake.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rcgen::{CertificateParams, DistinguishedName, KeyPair};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

use super::authority::{CertificateAuthority, OrderProgress, PendingOrder};
use super::challenge::{ChallengePublisher, PropagationCheck};
use super::error::AcmeError;
use super::storage::{CertificateMeta, CertificateStorage};
use crate::metrics::{IssuanceOutcome, ServerMetrics};
use crate::tls::{CertificateBundle, CertificateResolver};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Issuance state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssuanceState {
    Idle,
    Requested,
    ChallengePublished,
    Validating,
    Issued,
    Failed,
}

/// Certificate issuance for the zone apex and its wildcard
pub struct AcmeCoordinator {
    authority: Arc<dyn CertificateAuthority>,
    publisher: ChallengePublisher,
    resolver: Arc<CertificateResolver>,
    storage: Option<Arc<CertificateStorage>>,
    domain: String,
    names: Vec<String>,
    directory: String,
    validation_timeout: Duration,
    poll_interval: Duration,
    propagation: Option<PropagationCheck>,
    metrics: Option<ServerMetrics>,
    state: Mutex<IssuanceState>,
    /// Held for the duration of an attempt
    in_flight: tokio::sync::Mutex<()>,
}

impl AcmeCoordinator {
    pub fn new(
        authority: Arc<dyn CertificateAuthority>,
        publisher: ChallengePublisher,
        resolver: Arc<CertificateResolver>,
        domain: impl Into<String>,
    ) -> Self {
        let domain = domain.into();
        Self {
            authority,
            publisher,
            resolver,
            storage: None,
            names: vec![format!("*.{}", domain), domain.clone()],
            domain,
            directory: String::new(),
            validation_timeout: Duration::from_secs(120),
            poll_interval: DEFAULT_POLL_INTERVAL,
            propagation: None,
            metrics: None,
            state: Mutex::new(IssuanceState::Idle),
            in_flight: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_storage(mut self, storage: Arc<CertificateStorage>, directory: &str) -> Self {
        self.storage = Some(storage);
        self.directory = directory.to_string();
        self
    }

    /// Upper bound on waiting for propagation and for the authority
    pub fn with_validation_timeout(mut self, limit: Duration) -> Self {
        self.validation_timeout = limit;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_propagation_check(mut self, check: PropagationCheck) -> Self {
        self.propagation = Some(check);
        self
    }

    pub fn with_metrics(mut self, metrics: ServerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn state(&self) -> IssuanceState {
        *self.state.lock()
    }

    fn transition(&self, next: IssuanceState) {
        let mut state = self.state.lock();
        debug!(domain = %self.domain, from = ?*state, to = ?next, "Issuance state change");
        *state = next;
    }

    /// Install a stored certificate that is still valid.
    ///
    /// Returns whether one was installed.
    pub fn install_stored(&self) -> Result<bool, AcmeError> {
        let Some(storage) = &self.storage else {
            return Ok(false);
        };
        let Some(stored) = storage.load_certificate(&self.domain)? else {
            return Ok(false);
        };
        if stored.meta.expires <= Utc::now() {
            info!(
                domain = %self.domain,
                expires = %stored.meta.expires,
                "Stored certificate expired"
            );
            return Ok(false);
        }

        self.resolver.install(stored.bundle()?);
        self.transition(IssuanceState::Issued);
        info!(
            domain = %self.domain,
            expires = %stored.meta.expires,
            "Installed stored certificate"
        );
        Ok(true)
    }

    /// Whether the served certificate is missing or expires within `days`
    pub fn needs_issuance(&self, days: u32) -> bool {
        match self.resolver.not_after() {
            Some(not_after) => chrono::Duration::try_days(i64::from(days))
                .and_then(|window| Utc::now().checked_add_signed(window))
                .is_none_or(|horizon| not_after <= horizon),
            None => true,
        }
    }

    /// Run one issuance attempt.
    ///
    /// Fails with [`AcmeError::InProgress`] if another attempt is running.
    /// Any failure leaves the current certificate (if any) in place.
    pub async fn issue(&self) -> Result<(), AcmeError> {
        let Ok(_attempt) = self.in_flight.try_lock() else {
            debug!(domain = %self.domain, "Issuance already in progress");
            return Err(AcmeError::InProgress);
        };

        let start = Instant::now();
        self.transition(IssuanceState::Requested);
        info!(domain = %self.domain, names = ?self.names, "Requesting certificate");

        let result = self.attempt().await;
        self.publisher.withdraw();

        match result {
            Ok(bundle) => {
                let not_after = bundle.not_after();
                self.resolver.install(bundle);
                self.transition(IssuanceState::Issued);
                self.record(IssuanceOutcome::Issued);
                info!(
                    domain = %self.domain,
                    not_after = %not_after,
                    elapsed_secs = start.elapsed().as_secs(),
                    "Certificate issued"
                );
                Ok(())
            }
            Err(e) => {
                self.transition(IssuanceState::Failed);
                self.record(IssuanceOutcome::Failed);
                error!(domain = %self.domain, error = %e, "Certificate issuance failed");
                Err(e)
            }
        }
    }

    async fn attempt(&self) -> Result<CertificateBundle, AcmeError> {
        let mut order = self
            .bounded("order creation", self.authority.new_order(&self.names))
            .await?;

        let challenges = self
            .bounded("challenge retrieval", order.dns_challenges())
            .await?;
        self.publisher
            .publish(challenges.iter().map(|c| c.value.clone()).collect());
        self.transition(IssuanceState::ChallengePublished);

        if let Some(check) = &self.propagation {
            let expected = self.publisher.published();
            check.wait_for(&expected, self.validation_timeout).await?;
        }

        for challenge in &challenges {
            self.bounded("validation request", order.set_ready(challenge))
                .await?;
        }
        self.transition(IssuanceState::Validating);

        let progress = self.wait_for_order(order.as_mut()).await?;

        if progress == OrderProgress::Valid {
            // Issued against a key this attempt does not hold
            return Err(AcmeError::Finalization(
                "order was finalized by an earlier attempt".to_string(),
            ));
        }
        let (csr, key_pem) = certificate_request(&self.names)?;
        self.bounded("finalization", order.finalize(&csr)).await?;
        let chain = self.wait_for_certificate(order.as_mut()).await?;

        let bundle = CertificateBundle::from_pem(&chain, &key_pem)?;
        self.persist(&chain, &key_pem, &bundle);
        Ok(bundle)
    }

    /// A single authority round trip, bounded by the validation timeout
    async fn bounded<T>(
        &self,
        step: &'static str,
        call: impl std::future::Future<Output = Result<T, AcmeError>>,
    ) -> Result<T, AcmeError> {
        let limit = self.validation_timeout;
        timeout(limit, call)
            .await
            .map_err(|_| AcmeError::Timeout(limit, step))?
    }

    /// Poll until the order is ready (or already valid), bounded
    async fn wait_for_order(
        &self,
        order: &mut dyn PendingOrder,
    ) -> Result<OrderProgress, AcmeError> {
        let limit = self.validation_timeout;
        timeout(limit, async {
            loop {
                match order.refresh().await? {
                    progress @ (OrderProgress::Ready | OrderProgress::Valid) => return Ok(progress),
                    OrderProgress::Invalid(reason) => {
                        return Err(AcmeError::ChallengeValidation(reason))
                    }
                    OrderProgress::Pending | OrderProgress::Processing => {
                        sleep(self.poll_interval).await
                    }
                }
            }
        })
        .await
        .map_err(|_| AcmeError::Timeout(limit, "challenge validation"))?
    }

    async fn wait_for_certificate(
        &self,
        order: &mut dyn PendingOrder,
    ) -> Result<String, AcmeError> {
        let limit = self.validation_timeout;
        timeout(limit, async {
            loop {
                if let Some(chain) = order.certificate().await? {
                    return Ok::<_, AcmeError>(chain);
                }
                sleep(self.poll_interval).await;
            }
        })
        .await
        .map_err(|_| AcmeError::Timeout(limit, "certificate download"))?
    }

    /// Storage failures keep the freshly issued certificate in memory
    fn persist(&self, chain: &str, key_pem: &str, bundle: &CertificateBundle) {
        let Some(storage) = &self.storage else {
            return;
        };
        let meta = CertificateMeta {
            expires: bundle.not_after(),
            issued: Utc::now(),
            names: self.names.clone(),
            directory: self.directory.clone(),
        };
        if let Err(e) = storage.save_certificate(&self.domain, chain, key_pem, &meta) {
            warn!(domain = %self.domain, error = %e, "Failed to persist certificate");
        }
    }

    fn record(&self, outcome: IssuanceOutcome) {
        if let Some(metrics) = &self.metrics {
            metrics.issuance(outcome);
        }
    }
}

impl std::fmt::Debug for AcmeCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcmeCoordinator")
            .field("domain", &self.domain)
            .field("state", &self.state())
            .field("validation_timeout", &self.validation_timeout)
            .finish()
    }
}

/// Fresh key and DER CSR covering `names`
fn certificate_request(names: &[String]) -> Result<(Vec<u8>, String), AcmeError> {
    let key = KeyPair::generate().map_err(|e| AcmeError::Csr(e.to_string()))?;
    let mut params =
        CertificateParams::new(names.to_vec()).map_err(|e| AcmeError::Csr(e.to_string()))?;
    params.distinguished_name = DistinguishedName::new();
    let csr = params
        .serialize_request(&key)
        .map_err(|e| AcmeError::Csr(e.to_string()))?;
    Ok((csr.der().to_vec(), key.serialize_pem()))
}


#[cfg(test)]
mod tests {
    use super::test_support::FakeAuthority;
    use super::*;
    use crate::dns::{TxtRecordCell, TxtRecordHandle};
    use tempfile::TempDir;

    fn publisher() -> (ChallengePublisher, Arc<TxtRecordCell>) {
        let cell = TxtRecordCell::new();
        (
            ChallengePublisher::new(TxtRecordHandle::new(Arc::clone(&cell))),
            cell,
        )
    }

    fn coordinator(authority: FakeAuthority, publisher: ChallengePublisher) -> AcmeCoordinator {
        AcmeCoordinator::new(
            Arc::new(authority),
            publisher,
            CertificateResolver::new(),
            "example.com",
        )
        .with_poll_interval(Duration::from_millis(5))
        .with_validation_timeout(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_successful_issuance_publishes_then_withdraws() {
        let (publisher, cell) = publisher();
        let mut authority = FakeAuthority::succeeding();
        authority.publisher = Some(publisher.clone());
        let seen = Arc::clone(&authority.seen_at_ready);

        let metrics = ServerMetrics::new().unwrap();
        let coordinator = coordinator(authority, publisher).with_metrics(metrics.clone());
        assert!(coordinator.needs_issuance(30));

        coordinator.issue().await.unwrap();

        assert_eq!(coordinator.state(), IssuanceState::Issued);
        assert!(coordinator.resolver.is_ready());
        assert!(!coordinator.needs_issuance(0));
        assert!(cell.load().is_empty());
        assert_eq!(metrics.issuance_count(IssuanceOutcome::Issued), 1);

        // Both values were live when the authority was told to validate
        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(
            seen[0],
            vec!["value-for-example.com", "value-for-example.com"]
        );
    }

    #[tokio::test]
    async fn test_authority_error_degrades_gracefully() {
        let (publisher, cell) = publisher();
        let metrics = ServerMetrics::new().unwrap();
        let coordinator =
            coordinator(FakeAuthority::failing(), publisher).with_metrics(metrics.clone());

        let err = coordinator.issue().await.unwrap_err();
        assert!(matches!(err, AcmeError::OrderCreation(_)));
        assert_eq!(coordinator.state(), IssuanceState::Failed);
        assert!(!coordinator.resolver.is_ready());
        assert!(cell.load().is_empty());
        assert_eq!(metrics.issuance_count(IssuanceOutcome::Failed), 1);
    }

    #[tokio::test]
    async fn test_invalid_order_fails() {
        let (publisher, cell) = publisher();
        let mut authority = FakeAuthority::succeeding();
        authority.invalid = true;
        let coordinator = coordinator(authority, publisher);

        let err = coordinator.issue().await.unwrap_err();
        assert!(matches!(err, AcmeError::ChallengeValidation(_)));
        assert!(cell.load().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_is_bounded() {
        let (publisher, _) = publisher();
        let mut authority = FakeAuthority::succeeding();
        authority.pending_refreshes = usize::MAX;
        let coordinator = coordinator(authority, publisher)
            .with_validation_timeout(Duration::from_secs(1));

        let err = coordinator.issue().await.unwrap_err();
        assert!(matches!(err, AcmeError::Timeout(_, "challenge validation")));
        assert_eq!(coordinator.state(), IssuanceState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_authority_is_bounded() {
        let (publisher, cell) = publisher();
        let mut authority = FakeAuthority::succeeding();
        authority.silent_on_ready = true;
        let coordinator = coordinator(authority, publisher)
            .with_validation_timeout(Duration::from_secs(1));

        let err = tokio::time::timeout(Duration::from_secs(60), coordinator.issue())
            .await
            .expect("issuance returned")
            .unwrap_err();
        assert!(matches!(err, AcmeError::Timeout(_, "validation request")));
        assert_eq!(coordinator.state(), IssuanceState::Failed);
        assert!(cell.load().is_empty());

        // The lock is released, so the next cycle can try again
        assert!(!matches!(coordinator.issue().await, Err(AcmeError::InProgress)));
    }

    #[test]
    fn test_far_renewal_window_does_not_overflow() {
        let (publisher, _) = publisher();
        let coordinator = coordinator(FakeAuthority::succeeding(), publisher);
        let (cert, key) = crate::tls::test_support::self_signed(&["example.com"]);
        coordinator
            .resolver
            .install(CertificateBundle::from_pem(&cert, &key).unwrap());

        assert!(coordinator.needs_issuance(u32::MAX));
        assert!(!coordinator.needs_issuance(0));
    }

    #[tokio::test]
    async fn test_single_attempt_in_flight() {
        let (publisher, _) = publisher();
        let mut authority = FakeAuthority::succeeding();
        authority.pending_refreshes = 20;
        let coordinator = Arc::new(coordinator(authority, publisher));

        let (first, second) = tokio::join!(coordinator.issue(), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            coordinator.issue().await
        });

        assert!(first.is_ok());
        assert!(matches!(second, Err(AcmeError::InProgress)));
    }

    #[tokio::test]
    async fn test_issued_certificate_persisted_and_reinstalled() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(CertificateStorage::new(dir.path()).unwrap());

        let (publisher, _) = publisher();
        let coordinator = coordinator(FakeAuthority::succeeding(), publisher)
            .with_storage(Arc::clone(&storage), "https://ca.test/directory");
        coordinator.issue().await.unwrap();

        let (publisher, _) = self::publisher();
        let restarted = self::coordinator(FakeAuthority::failing(), publisher)
            .with_storage(storage, "https://ca.test/directory");
        assert!(restarted.install_stored().unwrap());
        assert!(restarted.resolver.is_ready());
        assert_eq!(restarted.state(), IssuanceState::Issued);
    }
}
