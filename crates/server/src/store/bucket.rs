//! Per-correlation-id bucket of interaction records.

use ricochet_common::{AuthToken, InteractionRecord};
use std::time::Duration;
use tokio::time::Instant;

/// All records captured for one correlation id.
#[derive(Debug)]
pub(crate) struct CorrelationBucket {
    records: Vec<InteractionRecord>,
    created_at: Instant,
    last_written_at: Instant,
    auth_token: Option<AuthToken>,
    /// Explicitly registered (as opposed to created by a first `put`)
    registered: bool,
    /// Survives eviction; only its records are dropped
    persistent: bool,
    /// Auxiliary state stashed by the post-processing stage
    internal: Option<serde_json::Value>,
}

impl CorrelationBucket {
    /// Bucket created implicitly by a write
    pub(crate) fn implicit(now: Instant) -> Self {
        Self {
            records: Vec::new(),
            created_at: now,
            last_written_at: now,
            auth_token: None,
            registered: false,
            persistent: false,
            internal: None,
        }
    }

    /// Bucket created by registration
    pub(crate) fn registered(now: Instant, token: Option<AuthToken>, persistent: bool) -> Self {
        Self {
            auth_token: token,
            registered: true,
            persistent,
            ..Self::implicit(now)
        }
    }

    /// Stale once strictly more than `ttl` has passed since the last write
    pub(crate) fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.last_written_at) > ttl
    }

    pub(crate) fn append(&mut self, record: InteractionRecord, now: Instant) {
        self.records.push(record);
        self.last_written_at = now;
    }

    /// Take every record, leaving the bucket registered and empty
    pub(crate) fn drain(&mut self) -> Vec<InteractionRecord> {
        std::mem::take(&mut self.records)
    }

    /// Start over after the retention window passed.
    ///
    /// A persistent bucket keeps its token; any other bucket becomes a fresh
    /// implicit one. Returns `true` if auxiliary state was dropped.
    pub(crate) fn restart(&mut self, now: Instant) -> bool {
        let had_internal = self.internal.is_some();
        if self.persistent {
            self.records.clear();
            self.internal = None;
            self.created_at = now;
            self.last_written_at = now;
        } else {
            *self = Self::implicit(now);
        }
        had_internal
    }

    /// Drop content of a stale persistent bucket. Returns `true` if anything was dropped.
    pub(crate) fn clear_stale(&mut self) -> bool {
        let had_content = !self.records.is_empty() || self.internal.is_some();
        self.records.clear();
        self.internal = None;
        had_content
    }

    pub(crate) fn adopt_registration(&mut self, token: Option<AuthToken>, persistent: bool) {
        self.auth_token = token;
        self.registered = true;
        self.persistent |= persistent;
    }

    pub(crate) fn auth_token(&self) -> Option<&AuthToken> {
        self.auth_token.as_ref()
    }

    pub(crate) fn is_registered(&self) -> bool {
        self.registered
    }

    pub(crate) fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub(crate) fn mark_persistent(&mut self) {
        self.persistent = true;
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    pub(crate) fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    pub(crate) fn set_internal(&mut self, payload: serde_json::Value) {
        self.internal = Some(payload);
    }

    pub(crate) fn take_internal(&mut self) -> Option<serde_json::Value> {
        self.internal.take()
    }

    pub(crate) fn internal(&self) -> Option<&serde_json::Value> {
        self.internal.as_ref()
    }
}

/// Token equality for registration checks, constant-time when both are set
pub(crate) fn same_token(a: Option<&AuthToken>, b: Option<&AuthToken>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.matches(Some(b.expose())),
        _ => false,
    }
}
