//! Background certificate renewal
//!
//! Re-enters issuance when the served certificate is close to expiry, or
//! when no certificate could be obtained yet.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::coordinator::AcmeCoordinator;
use super::error::AcmeError;

/// Default check interval (12 hours)
const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(12 * 3600);

/// Minimum check interval (1 hour)
const MIN_CHECK_INTERVAL: Duration = Duration::from_secs(3600);

/// Periodic renewal task
pub struct RenewalScheduler {
    coordinator: Arc<AcmeCoordinator>,
    renew_before_days: u32,
    check_interval: Duration,
}

impl RenewalScheduler {
    pub fn new(coordinator: Arc<AcmeCoordinator>, renew_before_days: u32) -> Self {
        Self {
            coordinator,
            renew_before_days,
            check_interval: DEFAULT_CHECK_INTERVAL,
        }
    }

    /// Clamped to at least one hour
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval.max(MIN_CHECK_INTERVAL);
        self
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    /// Issue immediately if needed, then check on every interval until
    /// `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            domain = %self.coordinator.domain(),
            check_interval_hours = self.check_interval.as_secs() / 3600,
            renew_before_days = self.renew_before_days,
            "Starting certificate renewal scheduler"
        );

        self.check_once().await;

        let mut ticker = interval_at(Instant::now() + self.check_interval, self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Renewal scheduler stopping");
                    return;
                }
                _ = ticker.tick() => self.check_once().await,
            }
        }
    }

    /// One renewal check; failures are logged and retried next cycle
    pub async fn check_once(&self) {
        if !self.coordinator.needs_issuance(self.renew_before_days) {
            debug!(domain = %self.coordinator.domain(), "Certificate is still valid");
            return;
        }

        match self.coordinator.issue().await {
            Ok(()) => {}
            Err(AcmeError::InProgress) => {
                debug!("Skipping renewal check, issuance in progress");
            }
            Err(e) => {
                warn!(
                    domain = %self.coordinator.domain(),
                    error = %e,
                    retry_in_secs = self.check_interval.as_secs(),
                    "Certificate unavailable, serving plaintext only until next attempt"
                );
            }
        }
    }
}

impl std::fmt::Debug for RenewalScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenewalScheduler")
            .field("domain", &self.coordinator.domain())
            .field("check_interval", &self.check_interval)
            .finish()
    }
}
