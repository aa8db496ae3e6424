//! HTTP capture listener and client API
//!
//! Requests to a subdomain (or whose first path segment is a correlation
//! id) are captured. Requests to the bare domain under `/register`,
//! `/deregister`, `/poll` and `/metrics` form the client API.

mod handler;
mod server;

pub use handler::HttpHandler;
pub use server::HttpListener;
