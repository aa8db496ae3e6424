//! Capture Orchestrator contract
//!
//! Every protocol listener implements [`Listener`] and hands captured
//! interactions to a shared [`CaptureSink`]. The sink is the only path from
//! a listener into the store, and it never fails back into the listener:
//! capture is best-effort and must not delay the protocol response.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ricochet_common::{CorrelationId, InteractionRecord, Protocol};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::metrics::ServerMetrics;
use crate::shutdown::{InFlightGuard, ShutdownCoordinator};
use crate::store::Store;

/// Errors that end a listener
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to bind {protocol} listener on {addr}: {source}")]
    Bind {
        protocol: Protocol,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("{protocol} listener I/O error: {source}")]
    Io {
        protocol: Protocol,
        #[source]
        source: io::Error,
    },

    #[error("DNS protocol error: {0}")]
    Dns(#[from] hickory_proto::error::ProtoError),
}

impl ListenerError {
    pub fn io(protocol: Protocol, source: io::Error) -> Self {
        ListenerError::Io { protocol, source }
    }
}

/// An independently running protocol listener.
#[async_trait]
pub trait Listener: Send + 'static {
    fn protocol(&self) -> Protocol;

    fn local_addr(&self) -> SocketAddr;

    /// Serve until `shutdown` is cancelled.
    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<(), ListenerError>;
}

/// Optional stage run after every stored interaction.
///
/// Runs on the listener's task; implementations must not block.
pub trait PostProcessor: Send + Sync {
    fn process(&self, store: &Store, id: &CorrelationId, record: &InteractionRecord);
}

/// Shared entry point from listeners into the store.
#[derive(Clone)]
pub struct CaptureSink {
    store: Arc<Store>,
    fallback: Option<CorrelationId>,
    post: Option<Arc<dyn PostProcessor>>,
    metrics: Option<ServerMetrics>,
    shutdown: Option<ShutdownCoordinator>,
}

impl CaptureSink {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            fallback: None,
            post: None,
            metrics: None,
            shutdown: None,
        }
    }

    /// Bucket used when a listener has no id of its own (companion records)
    pub fn with_fallback(mut self, id: Option<CorrelationId>) -> Self {
        self.fallback = id;
        self
    }

    pub fn with_post_processor(mut self, post: Arc<dyn PostProcessor>) -> Self {
        self.post = Some(post);
        self
    }

    pub fn with_metrics(mut self, metrics: ServerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownCoordinator) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn fallback(&self) -> Option<&CorrelationId> {
        self.fallback.as_ref()
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Mark a connection in flight for graceful shutdown
    pub fn track(&self) -> Option<InFlightGuard> {
        self.shutdown.as_ref().map(ShutdownCoordinator::track)
    }

    /// Store `record` under `id`, or under the fallback bucket when `id` is
    /// absent. Returns whether anything was stored.
    pub fn capture(&self, id: Option<CorrelationId>, record: InteractionRecord) -> bool {
        let protocol = record.protocol;
        let Some(id) = id.or_else(|| self.fallback.clone()) else {
            trace!(protocol = %protocol, remote = %record.remote_address, "No correlation id, not captured");
            self.dropped(protocol);
            return false;
        };

        let record = if record.correlation_id == id {
            record
        } else {
            record.refiled(id.clone())
        };

        debug!(
            protocol = %protocol,
            correlation_id = %id,
            remote = %record.remote_address,
            "Captured interaction"
        );

        match &self.post {
            Some(post) => {
                self.store.put(&id, record.clone());
                post.process(&self.store, &id, &record);
            }
            None => self.store.put(&id, record),
        }

        if let Some(metrics) = &self.metrics {
            metrics.interaction_captured(protocol);
        }
        true
    }

    /// Count a request that carried no usable id
    pub fn dropped(&self, protocol: Protocol) {
        if let Some(metrics) = &self.metrics {
            metrics.interaction_dropped(protocol);
        }
    }
}

impl std::fmt::Debug for CaptureSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSink")
            .field("fallback", &self.fallback.is_some())
            .field("has_post_processor", &self.post.is_some())
            .finish()
    }
}

/// Pause after a failed accept so a persistent error (EMFILE) does not spin
pub(crate) const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Log a failed accept and back off, returning early on shutdown
pub(crate) async fn accept_failed(
    protocol: Protocol,
    error: &io::Error,
    shutdown: &CancellationToken,
) {
    warn!(protocol = %protocol, error = %error, "Accept failed");
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
    }
}

/// Log a per-connection failure without ending the listener
pub(crate) fn contain(protocol: Protocol, peer: SocketAddr, error: impl std::fmt::Display) {
    warn!(protocol = %protocol, peer = %peer, error = %error, "Connection error");
}
