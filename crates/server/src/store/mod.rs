//! Correlation store
//!
//! Concurrent map from correlation id to the interactions captured for it.
//! Every protocol listener writes here independently; polling clients read
//! (and drain) it through the HTTP API.
//!
//! # Concurrency
//!
//! Buckets live in a sharded `DashMap`, so writers to different ids rarely
//! contend and all mutation of one bucket happens under its shard lock.
//! `put`, `get`, `register_id` and the eviction sweep each hold that lock
//! only for in-memory work. Hooks run after the lock is released.
//!
//! # Read contract
//!
//! [`Store::get`] drains: it returns every live record and removes them from
//! the bucket, so each record is delivered to a poller once. The bucket
//! (and its token) stays registered until evicted or removed.
//!
//! # Eviction
//!
//! A bucket whose last write is older than the eviction duration is never
//! returned again, even before the background sweep removes it. Persistent
//! buckets (token bucket, root-TLD bucket) only lose their records.

mod bucket;
mod sweeper;

pub use sweeper::EvictionSweeper;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ricochet_common::{AuthToken, CorrelationId, InteractionRecord};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, trace};

use bucket::{same_token, CorrelationBucket};

/// Store errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("correlation id not found: {0}")]
    NotFound(CorrelationId),

    #[error("correlation id already registered with a different token: {0}")]
    AlreadyRegistered(CorrelationId),
}

/// Typed extension point for the post-processing stage.
///
/// `on_store` fires when auxiliary state is stashed for an id,
/// `on_cleanup` when that state (or the whole bucket) goes away.
pub trait StoreHooks: Send + Sync {
    fn on_store(&self, _id: &CorrelationId, _payload: &serde_json::Value) {}

    fn on_cleanup(&self, _id: &CorrelationId) {}
}

/// Snapshot of store occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreStats {
    pub buckets: usize,
    pub records: usize,
}

/// Builder for [`Store`]
pub struct StoreBuilder {
    eviction: Duration,
    global_token: Option<AuthToken>,
    hooks: Option<Arc<dyn StoreHooks>>,
}

impl StoreBuilder {
    /// Token required for every read when authentication is mandatory
    pub fn global_token(mut self, token: Option<AuthToken>) -> Self {
        self.global_token = token;
        self
    }

    pub fn hooks(mut self, hooks: Arc<dyn StoreHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn build(self) -> Store {
        debug!(
            eviction_secs = self.eviction.as_secs(),
            global_token = self.global_token.is_some(),
            hooks = self.hooks.is_some(),
            "Creating correlation store"
        );
        Store {
            buckets: DashMap::new(),
            eviction: self.eviction,
            global_token: self.global_token,
            hooks: self.hooks,
        }
    }
}

/// Correlation-indexed interaction store
pub struct Store {
    buckets: DashMap<CorrelationId, CorrelationBucket>,
    /// Fixed at construction
    eviction: Duration,
    global_token: Option<AuthToken>,
    hooks: Option<Arc<dyn StoreHooks>>,
}

impl Store {
    /// Open store (no global token, no hooks)
    pub fn new(eviction: Duration) -> Self {
        Self::builder(eviction).build()
    }

    pub fn builder(eviction: Duration) -> StoreBuilder {
        StoreBuilder {
            eviction,
            global_token: None,
            hooks: None,
        }
    }

    pub fn eviction(&self) -> Duration {
        self.eviction
    }

    /// Whether every read must present the global token
    pub fn requires_token(&self) -> bool {
        self.global_token.is_some()
    }

    /// Append `record` to the bucket for `id`, creating it if absent.
    pub fn put(&self, id: &CorrelationId, record: InteractionRecord) {
        let now = Instant::now();
        let dropped_internal = {
            let mut bucket = self
                .buckets
                .entry(id.clone())
                .or_insert_with(|| CorrelationBucket::implicit(now));

            let dropped = if bucket.is_expired(now, self.eviction) {
                trace!(correlation_id = %id, "Restarting stale bucket on write");
                bucket.restart(now)
            } else {
                false
            };

            bucket.append(record, now);
            trace!(correlation_id = %id, records = bucket.len(), "Stored interaction");
            dropped
        };

        if dropped_internal {
            self.fire_cleanup(id);
        }
    }

    /// Drain the records for `id`.
    ///
    /// Unknown and expired ids yield an empty list. When a global token is
    /// set it is required even for unknown ids.
    pub fn get(
        &self,
        id: &CorrelationId,
        token: Option<&str>,
    ) -> Result<Vec<InteractionRecord>, StoreError> {
        let master = self.check_global(token)?;

        let now = Instant::now();
        let Some(mut bucket) = self.buckets.get_mut(id) else {
            return Ok(Vec::new());
        };

        if bucket.is_expired(now, self.eviction) {
            return Ok(Vec::new());
        }

        if !master {
            if let Some(required) = bucket.auth_token() {
                if !required.matches(token) {
                    return Err(StoreError::Unauthorized);
                }
            }
        }

        let records = bucket.drain();
        if !records.is_empty() {
            debug!(correlation_id = %id, count = records.len(), "Drained interactions");
        }
        Ok(records)
    }

    /// Pre-create a bucket with an optional token. Idempotent.
    ///
    /// Re-registering with the same token succeeds. A bucket created
    /// implicitly by an earlier write adopts the token. A different token
    /// for a live registered bucket is rejected.
    pub fn register_id(&self, id: &CorrelationId, token: Option<AuthToken>) -> Result<(), StoreError> {
        self.register(id, token, false)
    }

    /// Register a bucket that eviction never removes (records still expire).
    pub fn register_persistent(
        &self,
        id: &CorrelationId,
        token: Option<AuthToken>,
    ) -> Result<(), StoreError> {
        self.register(id, token, true)
    }

    fn register(
        &self,
        id: &CorrelationId,
        token: Option<AuthToken>,
        persistent: bool,
    ) -> Result<(), StoreError> {
        let now = Instant::now();
        match self.buckets.entry(id.clone()) {
            Entry::Vacant(entry) => {
                entry.insert(CorrelationBucket::registered(now, token, persistent));
                debug!(correlation_id = %id, persistent, "Registered correlation id");
                Ok(())
            }
            Entry::Occupied(mut entry) => {
                let bucket = entry.get_mut();
                let stale = bucket.is_expired(now, self.eviction) && !bucket.is_persistent();

                if stale || !bucket.is_registered() {
                    if stale {
                        bucket.restart(now);
                    }
                    bucket.adopt_registration(token, persistent);
                    debug!(correlation_id = %id, persistent, "Registered correlation id");
                    Ok(())
                } else if same_token(bucket.auth_token(), token.as_ref()) {
                    if persistent {
                        bucket.mark_persistent();
                    }
                    trace!(correlation_id = %id, "Correlation id already registered");
                    Ok(())
                } else {
                    Err(StoreError::AlreadyRegistered(id.clone()))
                }
            }
        }
    }

    /// Remove a bucket on client request.
    ///
    /// Same authorization rule as [`Store::get`]. Returns whether a bucket
    /// was removed.
    pub fn remove(&self, id: &CorrelationId, token: Option<&str>) -> Result<bool, StoreError> {
        let master = self.check_global(token)?;

        if !master {
            if let Some(bucket) = self.buckets.get(id) {
                if let Some(required) = bucket.auth_token() {
                    if !required.matches(token) {
                        return Err(StoreError::Unauthorized);
                    }
                }
            }
        }

        let removed = self.buckets.remove(id).is_some();
        if removed {
            debug!(correlation_id = %id, "Removed correlation id");
            self.fire_cleanup(id);
        }
        Ok(removed)
    }

    /// Remove every bucket whose last write is older than the eviction window.
    ///
    /// Returns the number of buckets removed or emptied.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let ttl = self.eviction;
        let mut cleaned = Vec::new();

        self.buckets.retain(|id, bucket| {
            if !bucket.is_expired(now, ttl) {
                return true;
            }
            if bucket.is_persistent() {
                if bucket.clear_stale() {
                    cleaned.push(id.clone());
                }
                return true;
            }
            trace!(
                correlation_id = %id,
                age_secs = bucket.age(now).as_secs(),
                "Evicting bucket"
            );
            cleaned.push(id.clone());
            false
        });

        for id in &cleaned {
            self.fire_cleanup(id);
        }
        cleaned.len()
    }

    /// Stash auxiliary state for a live bucket and notify the hooks.
    pub fn set_internal(
        &self,
        id: &CorrelationId,
        payload: serde_json::Value,
    ) -> Result<(), StoreError> {
        let now = Instant::now();
        {
            let mut bucket = self
                .buckets
                .get_mut(id)
                .filter(|b| !b.is_expired(now, self.eviction))
                .ok_or_else(|| StoreError::NotFound(id.clone()))?;
            bucket.set_internal(payload.clone());
        }

        if let Some(hooks) = &self.hooks {
            hooks.on_store(id, &payload);
        }
        Ok(())
    }

    /// Drop auxiliary state for a bucket and notify the hooks.
    pub fn clear_internal(&self, id: &CorrelationId) -> Result<(), StoreError> {
        let had_internal = {
            let mut bucket = self
                .buckets
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(id.clone()))?;
            bucket.take_internal().is_some()
        };

        if had_internal {
            self.fire_cleanup(id);
        }
        Ok(())
    }

    /// Auxiliary state for a live bucket
    pub fn internal(&self, id: &CorrelationId) -> Option<serde_json::Value> {
        let now = Instant::now();
        self.buckets
            .get(id)
            .filter(|b| !b.is_expired(now, self.eviction))
            .and_then(|b| b.internal().cloned())
    }

    /// Whether a live bucket exists for `id`
    pub fn contains(&self, id: &CorrelationId) -> bool {
        let now = Instant::now();
        self.buckets
            .get(id)
            .is_some_and(|b| !b.is_expired(now, self.eviction))
    }

    pub fn stats(&self) -> StoreStats {
        self.buckets
            .iter()
            .fold(StoreStats::default(), |mut stats, bucket| {
                stats.buckets += 1;
                stats.records += bucket.len();
                stats
            })
    }

    /// Returns `Ok(true)` when the supplied token is the global token.
    fn check_global(&self, token: Option<&str>) -> Result<bool, StoreError> {
        match &self.global_token {
            Some(global) if global.matches(token) => Ok(true),
            Some(_) => Err(StoreError::Unauthorized),
            None => Ok(false),
        }
    }

    fn fire_cleanup(&self, id: &CorrelationId) {
        if let Some(hooks) = &self.hooks {
            hooks.on_cleanup(id);
        }
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("buckets", &self.buckets.len())
            .field("eviction", &self.eviction)
            .field("global_token", &self.global_token.is_some())
            .field("has_hooks", &self.hooks.is_some())
            .finish()
    }
}
