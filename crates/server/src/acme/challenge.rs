//! DNS-01 challenge publication
//!
//! Challenge values go straight into the running DNS listener through its
//! [`TxtRecordHandle`]. An optional [`PropagationCheck`] asks that listener
//! (over real DNS) whether the values are visible before the authority is
//! told to validate.

use std::net::SocketAddr;
use std::time::Duration;

use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use tokio::time::{sleep, timeout};
use tracing::{debug, trace};

use super::error::AcmeError;
use crate::dns::TxtRecordHandle;

/// Publishes and withdraws challenge values for one attempt
#[derive(Debug, Clone)]
pub struct ChallengePublisher {
    txt: TxtRecordHandle,
}

impl ChallengePublisher {
    pub fn new(txt: TxtRecordHandle) -> Self {
        Self { txt }
    }

    /// Serve exactly `values`, replacing anything left from earlier attempts
    pub fn publish(&self, values: Vec<String>) {
        debug!(count = values.len(), "Publishing DNS-01 challenge values");
        self.txt.set(values);
    }

    pub fn withdraw(&self) {
        trace!("Withdrawing DNS-01 challenge values");
        self.txt.clear();
    }

    pub fn published(&self) -> Vec<String> {
        self.txt.current().as_ref().clone()
    }
}

const PROPAGATION_POLL: Duration = Duration::from_millis(250);

/// Resolves the challenge name against a specific nameserver
pub struct PropagationCheck {
    resolver: TokioAsyncResolver,
    name: String,
}

impl PropagationCheck {
    /// Query `nameserver` for `challenge_name` without caching
    pub fn new(nameserver: SocketAddr, challenge_name: &str) -> Self {
        let group =
            NameServerConfigGroup::from_ips_clear(&[nameserver.ip()], nameserver.port(), true);
        let config = ResolverConfig::from_parts(None, vec![], group);

        let mut opts = ResolverOpts::default();
        opts.cache_size = 0;
        opts.attempts = 1;
        opts.timeout = Duration::from_secs(2);

        Self {
            resolver: TokioAsyncResolver::tokio(config, opts),
            name: format!("{}.", challenge_name.trim_end_matches('.')),
        }
    }

    /// Wait until every expected value is served, at most `limit`
    pub async fn wait_for(&self, expected: &[String], limit: Duration) -> Result<(), AcmeError> {
        timeout(limit, async {
            loop {
                if self.visible(expected).await {
                    debug!(name = %self.name, "Challenge values visible");
                    return;
                }
                sleep(PROPAGATION_POLL).await;
            }
        })
        .await
        .map_err(|_| AcmeError::Timeout(limit, "challenge propagation"))
    }

    async fn visible(&self, expected: &[String]) -> bool {
        match self.resolver.txt_lookup(self.name.as_str()).await {
            Ok(lookup) => {
                let served: Vec<String> = lookup.iter().map(|txt| txt.to_string()).collect();
                expected.iter().all(|value| served.contains(value))
            }
            Err(e) => {
                trace!(name = %self.name, error = %e, "Challenge lookup failed");
                false
            }
        }
    }
}

impl std::fmt::Debug for PropagationCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropagationCheck")
            .field("name", &self.name)
            .finish()
    }
}
