//! Outbound relay to remote MX hosts.
//!
//! - [`dns`]: MX record resolution
//! - [`forwarder`]: per-recipient delivery over a replayed SMTP conversation

pub mod dns;
pub mod forwarder;

pub use dns::{resolve_mx, MxRecord};
pub use forwarder::{ForwardOutcome, MailForwarder};
