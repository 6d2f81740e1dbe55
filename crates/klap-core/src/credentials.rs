//! Credentials and the KLAP authentication secret.
//!
//! A KLAP device never sees the user's password. Both sides instead hold a
//! 32-byte [`AuthSecret`] computed as `sha256(sha1(username) + sha1(password))`,
//! and prove knowledge of it during the handshake.
//!
//! The secret can be derived from [`Credentials`] every run, or derived once,
//! persisted as hex with [`AuthSecret::to_hex`], and loaded back with
//! [`AuthSecret::from_hex`].
//!
//! # Security
//!
//! Passwords are stored using [`SecretString`] from the `secrecy` crate to prevent
//! accidental logging or display. [`AuthSecret`] redacts itself in `Debug` output.

use std::fmt;

use secrecy::{ExposeSecret, SecretString};
use subtle::ConstantTimeEq;

use crate::{crypto::klap::derive_auth_secret, error::Error};

/// Length of the authentication secret in bytes.
pub const AUTH_SECRET_LEN: usize = 32;

/// Username and password for a KLAP device.
///
/// These are the TP-Link cloud account credentials the device was bound with,
/// or blank for devices that were never bound.
///
/// # Example
///
/// ```
/// use klap_core::Credentials;
///
/// let creds = Credentials::new("user@example.com", "password123");
/// assert_eq!(creds.username, "user@example.com");
/// assert_eq!(creds.expose_password(), "password123");
/// ```
#[derive(Clone)]
pub struct Credentials {
    /// The username (typically an email address for TP-Link cloud accounts).
    pub username: String,
    /// The password for the account (protected from accidental logging).
    password: SecretString,
}

impl Credentials {
    /// Creates new credentials with the given username and password.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::from(password.into()),
        }
    }

    /// Creates blank credentials (empty username and password).
    ///
    /// Blank credentials work for devices that have never been connected
    /// to the TP-Link cloud.
    pub fn blank() -> Self {
        Self::new("", "")
    }

    /// Returns `true` if both username and password are empty.
    pub fn is_blank(&self) -> bool {
        self.username.is_empty() && self.password.expose_secret().is_empty()
    }

    /// Exposes the password for hashing.
    ///
    /// Never log or display the returned value.
    pub fn expose_password(&self) -> &str {
        self.password.expose_secret()
    }

    /// Derives the authentication secret for these credentials.
    pub fn auth_secret(&self) -> AuthSecret {
        derive_auth_secret(self.username.as_bytes(), self.expose_password().as_bytes())
    }
}

impl Default for Credentials {
    fn default() -> Self {
        Self::blank()
    }
}

impl PartialEq for Credentials {
    fn eq(&self, other: &Self) -> bool {
        self.username == other.username
            && self.password.expose_secret() == other.password.expose_secret()
    }
}

impl Eq for Credentials {}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// The 32-byte secret both client and device use to authenticate a handshake.
///
/// # Example
///
/// ```
/// use klap_core::{AuthSecret, Credentials};
///
/// let secret = Credentials::new("user@example.com", "hunter2").auth_secret();
/// let persisted = secret.to_hex();
/// let restored = AuthSecret::from_hex(&persisted).unwrap();
/// assert_eq!(secret, restored);
/// ```
#[derive(Clone)]
pub struct AuthSecret([u8; AUTH_SECRET_LEN]);

impl AuthSecret {
    /// Wraps raw secret bytes.
    pub fn from_bytes(bytes: [u8; AUTH_SECRET_LEN]) -> Self {
        Self(bytes)
    }

    /// Parses a precomputed secret from hex.
    ///
    /// Leading and trailing whitespace is ignored, so values read from files
    /// or environment variables can be passed through directly.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidEncoding`] if the input is not valid hex or does
    /// not decode to exactly 32 bytes.
    pub fn from_hex(hex_str: &str) -> Result<Self, Error> {
        let bytes = hex::decode(hex_str.trim())
            .map_err(|e| Error::InvalidEncoding(format!("auth secret is not hex: {}", e)))?;

        let bytes: [u8; AUTH_SECRET_LEN] = bytes.try_into().map_err(|b: Vec<u8>| {
            Error::InvalidEncoding(format!(
                "auth secret must be {} bytes, got {}",
                AUTH_SECRET_LEN,
                b.len()
            ))
        })?;

        Ok(Self(bytes))
    }

    /// Encodes the secret as lowercase hex for persistence.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Returns the raw secret bytes.
    pub fn as_bytes(&self) -> &[u8; AUTH_SECRET_LEN] {
        &self.0
    }
}

impl From<&Credentials> for AuthSecret {
    fn from(credentials: &Credentials) -> Self {
        credentials.auth_secret()
    }
}

impl PartialEq for AuthSecret {
    fn eq(&self, other: &Self) -> bool {
        self.0[..].ct_eq(&other.0[..]).into()
    }
}

impl Eq for AuthSecret {}

impl fmt::Debug for AuthSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthSecret([REDACTED])")
    }
}
