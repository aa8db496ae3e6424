//! Ricochet Server Library
//!
//! An out-of-band interaction capture server. DNS, HTTP and SMTP listeners
//! (plus an optional SMB or responder companion) record every interaction
//! that names a caller-issued correlation id; clients poll for them later.
//!
//! - **Store**: per-id buckets with TTL eviction and token authorization
//! - **Capture**: the [`Listener`] contract and the shared [`CaptureSink`]
//! - **ACME**: DNS-01 issuance through the live DNS listener, TLS hot reload
//! - **Auth Gate**: one process-wide token when the policy demands it
//!
//! # Example
//!
//! ```ignore
//! use ricochet_config::ServerConfig;
//! use ricochet_server::App;
//!
//! let mut config = ServerConfig::for_domain("oast.example.com");
//! config.public_ip = Some("203.0.113.10".parse()?);
//!
//! let app = App::builder(config).build().await?;
//! app.run().await;
//! ```

// ============================================================================
// Module Declarations
// ============================================================================

pub mod acme;
pub mod app;
pub mod auth;
pub mod capture;
pub mod companion;
pub mod dns;
pub mod http;
pub mod metrics;
pub mod shutdown;
pub mod smtp;
pub mod store;
pub mod tls;
pub mod zone;

// ============================================================================
// Public API Re-exports
// ============================================================================

// Wiring
pub use app::{App, AppBuilder, AppError, BoundAddrs};

// Correlation store
pub use store::{EvictionSweeper, Store, StoreBuilder, StoreError, StoreHooks, StoreStats};

// Capture contract
pub use capture::{CaptureSink, Listener, ListenerError, PostProcessor};

// Authentication
pub use auth::{AuthError, AuthGate, TokenSource};

// Certificates
pub use acme::{AcmeCoordinator, IssuanceState};
pub use tls::CertificateResolver;

// Lifecycle
pub use shutdown::{wait_for_signal, ShutdownCoordinator};
