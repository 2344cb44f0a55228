//! SMTP protocol implementation:
//! - [`server`]: listener and session dispatch
//! - [`session`]: per-connection state machine
//! - [`stream`]: plain/TLS channel with idle timeout
//! - [`commands`]: command parsing
//! - [`responses`]: reply lines

pub mod commands;
pub mod responses;
pub mod server;
pub mod session;
pub mod stream;

pub use commands::SmtpCommand;
pub use responses::Reply;
pub use server::SmtpServer;
pub use session::SmtpSession;
pub use stream::Channel;
