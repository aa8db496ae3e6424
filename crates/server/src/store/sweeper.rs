//! Background eviction sweep

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::Store;
use crate::metrics::ServerMetrics;

/// Upper bound on the sweep period
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Periodically removes expired buckets.
///
/// Runs on its own timer, independent of read and write traffic. Each pass
/// holds one shard lock at a time, so writers are never starved.
pub struct EvictionSweeper {
    store: Arc<Store>,
    metrics: Option<ServerMetrics>,
    period: Duration,
}

impl EvictionSweeper {
    /// Sweep every `min(60s, eviction)`
    pub fn new(store: Arc<Store>) -> Self {
        let period = store
            .eviction()
            .min(MAX_SWEEP_INTERVAL)
            .max(Duration::from_millis(10));
        Self {
            store,
            metrics: None,
            period,
        }
    }

    pub fn with_metrics(mut self, metrics: ServerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Run until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            period_secs = self.period.as_secs(),
            eviction_secs = self.store.eviction().as_secs(),
            "Starting eviction sweeper"
        );

        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Eviction sweeper stopping");
                    return;
                }
                _ = ticker.tick() => {
                    self.sweep_once();
                }
            }
        }
    }

    /// One pass over the store; returns the number of buckets evicted
    pub fn sweep_once(&self) -> usize {
        let evicted = self.store.evict_expired();
        let stats = self.store.stats();

        if evicted > 0 {
            debug!(
                evicted,
                buckets = stats.buckets,
                records = stats.records,
                "Evicted expired buckets"
            );
        }

        if let Some(metrics) = &self.metrics {
            metrics.buckets_evicted(evicted);
            metrics.observe_store(stats);
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ricochet_common::{CorrelationId, InteractionRecord, Protocol};

    fn put(store: &Store, id: &str) {
        let id = CorrelationId::parse(id).unwrap();
        let record = InteractionRecord::new(
            Protocol::Dns,
            id.clone(),
            "192.0.2.1:53".parse().unwrap(),
        );
        store.put(&id, record);
    }

    #[test]
    fn test_period_is_capped() {
        let long = Arc::new(Store::new(Duration::from_secs(86_400)));
        assert_eq!(EvictionSweeper::new(long).period(), MAX_SWEEP_INTERVAL);

        let short = Arc::new(Store::new(Duration::from_secs(5)));
        assert_eq!(
            EvictionSweeper::new(short).period(),
            Duration::from_secs(5)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweep_evicts() {
        let store = Arc::new(Store::new(Duration::from_secs(2)));
        let metrics = ServerMetrics::new().unwrap();
        put(&store, "abc");

        let shutdown = CancellationToken::new();
        let sweeper = EvictionSweeper::new(Arc::clone(&store)).with_metrics(metrics.clone());
        let task = tokio::spawn(sweeper.run(shutdown.clone()));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(store.stats().buckets, 0);
        assert!(metrics
            .render()
            .unwrap()
            .contains("ricochet_buckets_evicted_total 1"));

        shutdown.cancel();
        task.await.unwrap();
    }
}
