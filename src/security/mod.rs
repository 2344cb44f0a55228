//! Security module
//!
//! Provides credential handling and TLS functionality:
//! - [`auth`]: password hashing and SASL PLAIN payload decoding
//! - [`tls`]: TLS/STARTTLS configuration for the server and the relay client

pub mod auth;
pub mod tls;

pub use tls::TlsConfig;
