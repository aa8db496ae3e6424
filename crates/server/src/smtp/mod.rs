//! SMTP capture listener
//!
//! Accepts any mail. On end of `DATA`, every distinct correlation id found
//! among the recipients gets one record holding the transaction transcript.

mod server;
mod session;

pub use server::SmtpListener;
pub use session::{SessionError, SmtpSession};
