//! Error types for klap-core.
//!
//! Every failure in the session core is returned to the caller as an
//! [`Error`]. Nothing here retries, logs, or swallows errors on its own; use
//! [`Error::is_retryable`] and [`Error::invalidates_session`] to drive retry
//! policy from the outside.

use thiserror::Error;

/// Error type for klap-core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A precomputed authentication secret was not valid hex of the right length.
    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),

    /// The operating system could not supply random bytes for a seed.
    #[error("randomness unavailable: {0}")]
    RandomnessUnavailable(String),

    /// Non-success status, network failure, or timeout.
    #[error("transport error: {0}")]
    Transport(String),

    /// The device rejected the handshake proof.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// A response body did not have the expected shape.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// The decrypted payload carried an impossible padding length.
    #[error("padding error: {0}")]
    Padding(String),

    /// The response signature did not match the one computed locally.
    #[error("integrity failure: response signature mismatch at seq {seq}")]
    IntegrityFailure {
        /// Sequence number the response was checked against.
        seq: i32,
    },
}

impl Error {
    /// Returns `true` if repeating the same operation may succeed.
    ///
    /// ```
    /// use klap_core::Error;
    ///
    /// assert!(Error::Transport("connection reset".into()).is_retryable());
    /// assert!(!Error::AuthenticationFailed("status 403".into()).is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::RandomnessUnavailable(_) | Error::IntegrityFailure { .. }
        )
    }

    /// Returns `true` if the error leaves the session unusable, so the next
    /// send has to run a fresh handshake.
    pub fn invalidates_session(&self) -> bool {
        matches!(self, Error::IntegrityFailure { .. })
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Transport(err.to_string())
    }
}
