//! Client-side session core for the TP-Link KLAP protocol.
//!
//! Newer Kasa and Tapo firmware only accepts commands over an authenticated,
//! encrypted HTTP session called KLAP. This crate establishes that session
//! and carries opaque request bytes through it; it never looks inside the
//! payloads.
//!
//! # Overview
//!
//! A session is built in two HTTP round trips (see [`handshake`]):
//!
//! 1. The client sends a random 16-byte seed to `/app/handshake1`. The device
//!    replies with its own seed and a proof over both seeds and the shared
//!    authentication secret, and sets a session cookie.
//! 2. The client sends its own proof to `/app/handshake2`. A `200` means both
//!    sides hold the same secret.
//!
//! Both seeds and the secret are then expanded into an AES-128 key, a base
//! IV, a starting sequence number, and a signing key. Each request bumps the
//! sequence number, is encrypted with AES-128-CBC under an IV built from it,
//! and is signed with SHA-256 (see [`crypto::klap`]). Responses are decrypted
//! with the same sequence number.
//!
//! # Example
//!
//! ```no_run
//! use klap_core::{Credentials, SessionConfig, SessionManager};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), klap_core::Error> {
//!     let secret = Credentials::new("user@example.com", "password").auth_secret();
//!     let manager = SessionManager::http("192.168.1.100", 80, secret, SessionConfig::new());
//!
//!     let response = manager.send(br#"{"system":{"get_sysinfo":{}}}"#).await?;
//!     println!("{}", String::from_utf8_lossy(&response));
//!     Ok(())
//! }
//! ```
//!
//! # Logging
//!
//! The crate emits `tracing` events at `debug` level only: handshake steps,
//! sequence numbers, and byte counts. Secrets, keys, and plaintext are never
//! logged. Errors are returned, not logged.

pub mod credentials;
pub mod crypto;
pub mod error;
pub mod handshake;
pub mod session;
pub mod transport;

#[cfg(test)]
mod testing;

pub use credentials::{AuthSecret, Credentials};
pub use error::Error;
pub use handshake::{HandshakeEngine, OsSeedSource, SeedSource};
pub use session::{SessionConfig, SessionManager};
pub use transport::{DEFAULT_PORT, DEFAULT_TIMEOUT, HttpTransport, TcpHttpTransport};

/// The version of the klap-core library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
