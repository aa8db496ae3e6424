//! Prometheus metrics for the capture server.
//!
//! Metrics live in a private [`Registry`] owned by [`ServerMetrics`] and are
//! exported in text format on `GET /metrics`.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use ricochet_common::Protocol;
use thiserror::Error;

use crate::store::StoreStats;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("failed to register metric: {0}")]
    Registration(#[from] prometheus::Error),

    #[error("failed to encode metrics: {0}")]
    Encoding(String),
}

/// Outcome label for `ricochet_acme_issuance_total`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssuanceOutcome {
    Issued,
    Failed,
    Skipped,
}

impl IssuanceOutcome {
    fn as_str(self) -> &'static str {
        match self {
            IssuanceOutcome::Issued => "issued",
            IssuanceOutcome::Failed => "failed",
            IssuanceOutcome::Skipped => "skipped",
        }
    }
}

/// Server metrics
///
/// Cheap to clone; every clone shares the same counters.
#[derive(Clone)]
pub struct ServerMetrics {
    registry: Registry,
    captured: IntCounterVec,
    dropped: IntCounterVec,
    evicted: IntCounter,
    issuance: IntCounterVec,
    buckets: IntGauge,
    records: IntGauge,
}

impl ServerMetrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let captured = IntCounterVec::new(
            Opts::new(
                "ricochet_interactions_captured_total",
                "Interactions stored, by protocol",
            ),
            &["protocol"],
        )?;
        registry.register(Box::new(captured.clone()))?;

        let dropped = IntCounterVec::new(
            Opts::new(
                "ricochet_interactions_dropped_total",
                "Interactions answered without a correlation id, by protocol",
            ),
            &["protocol"],
        )?;
        registry.register(Box::new(dropped.clone()))?;

        let evicted = IntCounter::new(
            "ricochet_buckets_evicted_total",
            "Correlation buckets removed or emptied by the eviction sweep",
        )?;
        registry.register(Box::new(evicted.clone()))?;

        let issuance = IntCounterVec::new(
            Opts::new(
                "ricochet_acme_issuance_total",
                "Certificate issuance attempts, by result",
            ),
            &["result"],
        )?;
        registry.register(Box::new(issuance.clone()))?;

        let buckets = IntGauge::new("ricochet_store_buckets", "Live correlation buckets")?;
        registry.register(Box::new(buckets.clone()))?;

        let records = IntGauge::new("ricochet_store_records", "Records awaiting a poll")?;
        registry.register(Box::new(records.clone()))?;

        Ok(Self {
            registry,
            captured,
            dropped,
            evicted,
            issuance,
            buckets,
            records,
        })
    }

    pub fn interaction_captured(&self, protocol: Protocol) {
        self.captured.with_label_values(&[protocol.as_str()]).inc();
    }

    pub fn interaction_dropped(&self, protocol: Protocol) {
        self.dropped.with_label_values(&[protocol.as_str()]).inc();
    }

    pub fn buckets_evicted(&self, count: usize) {
        self.evicted.inc_by(count as u64);
    }

    pub fn issuance(&self, outcome: IssuanceOutcome) {
        self.issuance.with_label_values(&[outcome.as_str()]).inc();
    }

    pub fn observe_store(&self, stats: StoreStats) {
        self.buckets.set(stats.buckets as i64);
        self.records.set(stats.records as i64);
    }

    pub fn captured_count(&self, protocol: Protocol) -> u64 {
        self.captured.with_label_values(&[protocol.as_str()]).get()
    }

    pub fn dropped_count(&self, protocol: Protocol) -> u64 {
        self.dropped.with_label_values(&[protocol.as_str()]).get()
    }

    pub fn issuance_count(&self, outcome: IssuanceOutcome) -> u64 {
        self.issuance.with_label_values(&[outcome.as_str()]).get()
    }

    /// Prometheus text exposition of every metric
    pub fn render(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| MetricsError::Encoding(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::Encoding(e.to_string()))
    }
}

impl std::fmt::Debug for ServerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerMetrics").finish_non_exhaustive()
    }
}
