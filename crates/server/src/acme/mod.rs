//! Automatic certificate management over DNS-01
//!
//! - [`AcmeCoordinator`]: issuance state machine, single attempt in flight
//! - [`ChallengePublisher`]: writes challenge values into the live DNS listener
//! - [`PropagationCheck`]: optional lookup against that listener before validation
//! - [`AcmeClient`]: `instant-acme` implementation of [`CertificateAuthority`]
//! - [`CertificateStorage`]: credentials and issued certificates on disk
//! - [`RenewalScheduler`]: background renewal
//!
//! # Challenge Flow
//!
//! 1. The coordinator opens an order for `*.domain` and `domain`
//! 2. Both DNS-01 values are published at `_acme-challenge.domain` in one swap
//! 3. Optionally, the coordinator waits until the DNS listener serves them
//! 4. The authority is told to validate; the order is polled (bounded)
//! 5. A CSR is finalized, the chain downloaded, persisted and installed
//! 6. Challenge values are withdrawn whatever the outcome
//!
//! Failure at any step leaves HTTP and SMTP serving plaintext (or the
//! previous certificate) and is retried on the next renewal cycle.

mod authority;
mod challenge;
mod client;
mod coordinator;
mod error;
mod scheduler;
mod storage;

pub use authority::{CertificateAuthority, DnsChallenge, OrderProgress, PendingOrder};
pub use challenge::{ChallengePublisher, PropagationCheck};
pub use client::AcmeClient;
pub use coordinator::{AcmeCoordinator, IssuanceState};
pub use error::{AcmeError, StorageError};
pub use scheduler::RenewalScheduler;
pub use storage::{CertificateMeta, CertificateStorage, StoredCertificate};
