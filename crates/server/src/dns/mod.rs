//! DNS listener
//!
//! Authoritative UDP server for the zone. Every query under the zone that
//! carries a correlation id is captured; the `_acme-challenge` name serves
//! whatever DNS-01 values the ACME Coordinator last published through a
//! [`TxtRecordHandle`].

mod answer;
mod server;
mod txt;

pub use answer::{describe, Answer, CapturedQuery, DnsAnswerer};
pub use server::DnsListener;
pub use txt::{TxtRecordCell, TxtRecordHandle};
