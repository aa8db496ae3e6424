//! Shared types for the ricochet interaction capture server.
//!
//! - [`CorrelationId`] / [`InteractionId`]: identifier newtypes
//! - [`InteractionRecord`]: one captured DNS/HTTP/SMTP/SMB event
//! - [`AuthToken`]: constant-time client token

pub mod ids;
pub mod interaction;
pub mod token;

pub use ids::{CorrelationId, InteractionId, InvalidCorrelationId, MAX_CORRELATION_ID_LEN};
pub use interaction::{InteractionRecord, Protocol, ProtocolDetails};
pub use token::AuthToken;
