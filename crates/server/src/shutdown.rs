//! Graceful shutdown coordination.
//!
//! A [`CancellationToken`] stops every accept loop; [`ShutdownCoordinator`]
//! counts in-flight captures so the process can wait for them to finish.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Tracks in-flight work and the process-wide cancellation token.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    in_flight: Arc<AtomicUsize>,
    token: CancellationToken,
    max_drain_time: Duration,
}

impl ShutdownCoordinator {
    pub fn new(max_drain_time: Duration) -> Self {
        debug!(
            max_drain_time_secs = max_drain_time.as_secs(),
            "Creating shutdown coordinator"
        );
        Self {
            in_flight: Arc::new(AtomicUsize::new(0)),
            token: CancellationToken::new(),
            max_drain_time,
        }
    }

    /// Token listeners watch to stop accepting
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Mark one unit of work in flight until the guard drops
    pub fn track(&self) -> InFlightGuard {
        let count = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        trace!(in_flight = count, "Work started");
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn request_shutdown(&self) {
        info!(in_flight = self.in_flight(), "Shutdown requested");
        self.token.cancel();
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait for in-flight work to finish.
    ///
    /// Returns `false` if the drain timeout passed with work still running.
    pub async fn wait_for_drain(&self) -> bool {
        let start = Instant::now();
        let initial = self.in_flight();

        info!(
            in_flight = initial,
            max_drain_time_secs = self.max_drain_time.as_secs(),
            "Draining in-flight captures"
        );

        let mut last_logged = initial;
        loop {
            let current = self.in_flight();
            if current == 0 {
                break;
            }
            if start.elapsed() > self.max_drain_time {
                warn!(
                    remaining = current,
                    elapsed_secs = start.elapsed().as_secs(),
                    "Drain timeout reached, work still in flight"
                );
                return false;
            }
            if current != last_logged {
                debug!(remaining = current, "Draining");
                last_logged = current;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        info!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            drained = initial,
            "All in-flight captures finished"
        );
        true
    }
}

impl std::fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("in_flight", &self.in_flight())
            .field("cancelled", &self.token.is_cancelled())
            .field("max_drain_time", &self.max_drain_time)
            .finish()
    }
}

/// Decrements the in-flight count on drop
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicUsize>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let count = self.in_flight.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        trace!(in_flight = count, "Work finished");
    }
}

/// Resolve on SIGINT or SIGTERM
pub async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!(signal = "SIGINT", "Received shutdown signal"),
        _ = terminate => info!(signal = "SIGTERM", "Received shutdown signal"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_guards_track_in_flight() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));

        let a = coordinator.track();
        let b = coordinator.track();
        assert_eq!(coordinator.in_flight(), 2);

        drop(a);
        assert_eq!(coordinator.in_flight(), 1);
        drop(b);

        assert!(coordinator.wait_for_drain().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_times_out() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let _stuck = coordinator.track();

        assert!(!coordinator.wait_for_drain().await);
    }

    #[tokio::test]
    async fn test_drain_waits_for_late_finish() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        let guard = coordinator.track();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            drop(guard);
        });

        assert!(coordinator.wait_for_drain().await);
    }

    #[test]
    fn test_request_shutdown_cancels_token() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let token = coordinator.token();
        assert!(!coordinator.is_shutdown_requested());

        coordinator.request_shutdown();
        assert!(token.is_cancelled());
        assert!(coordinator.is_shutdown_requested());
    }
}
