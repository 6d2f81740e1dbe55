//! Session lifecycle on top of the handshake and the session cipher.
//!
//! [`SessionManager`] is the only entry point callers need: it runs the
//! handshake when there is no session, encrypts the request, performs one
//! POST, and decrypts the response. The whole sequence holds an async mutex,
//! so concurrent `send` calls on one manager run one at a time and the
//! sequence counter can never be advanced between an encrypt and its decrypt.

use std::{fmt, sync::Arc, time::Duration};

use tokio::sync::Mutex;
use tracing::debug;

use crate::{
    credentials::AuthSecret,
    crypto::klap::SessionCodec,
    error::Error,
    handshake::{EstablishedSession, HandshakeEngine, SeedSource},
    transport::{
        CONTENT_TYPE_JSON, DEFAULT_TIMEOUT, HttpRequest, HttpTransport, REQUEST_PATH, SEQ_PARAM,
        SessionCookies, TcpHttpTransport, post_with_timeout,
    },
};

/// Tunables for a [`SessionManager`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Upper bound for each handshake round and each request.
    pub timeout: Duration,
    /// Pause between handshake 1 and handshake 2. Zero disables it.
    pub handshake_delay: Duration,
    /// Check the signature on every response before decrypting it.
    pub verify_signatures: bool,
    /// Reject the device's handshake 1 proof before sending handshake 2 if it
    /// does not match the local secret.
    pub strict_server_proof: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            handshake_delay: Duration::ZERO,
            verify_signatures: true,
            strict_server_proof: false,
        }
    }
}

impl SessionConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the delay between the two handshake rounds.
    ///
    /// Some devices answer handshake 2 more reliably if it does not arrive
    /// immediately after handshake 1.
    pub fn with_handshake_delay(mut self, delay: Duration) -> Self {
        self.handshake_delay = delay;
        self
    }

    /// Enables or disables response signature verification.
    pub fn with_signature_verification(mut self, verify: bool) -> Self {
        self.verify_signatures = verify;
        self
    }

    /// Enables or disables the handshake 1 proof check.
    pub fn with_strict_server_proof(mut self, strict: bool) -> Self {
        self.strict_server_proof = strict;
        self
    }
}

/// An established session: the cipher plus the cookies tying it to the device.
struct ActiveSession {
    codec: SessionCodec,
    cookies: SessionCookies,
}

enum SessionState {
    NoSession,
    Active(ActiveSession),
}

/// Owns one device session and serializes all traffic through it.
///
/// Share a manager between tasks with an [`Arc`]; do not create one manager
/// per task for the same device, since every handshake consumes device-side
/// resources.
///
/// # Example
///
/// ```no_run
/// use klap_core::{Credentials, SessionConfig, SessionManager};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let secret = Credentials::new("user@example.com", "password").auth_secret();
///     let manager = SessionManager::http("192.168.1.100", 80, secret, SessionConfig::new());
///
///     let response = manager.send(br#"{"system":{"get_sysinfo":{}}}"#).await?;
///     println!("{}", String::from_utf8_lossy(&response));
///     Ok(())
/// }
/// ```
pub struct SessionManager<T> {
    transport: T,
    auth_secret: AuthSecret,
    config: SessionConfig,
    engine: HandshakeEngine,
    state: Mutex<SessionState>,
}

impl SessionManager<TcpHttpTransport> {
    /// Creates a manager talking raw HTTP to `host:port`.
    ///
    /// No network traffic happens until the first [`send`](Self::send).
    pub fn http(
        host: impl Into<String>,
        port: u16,
        auth_secret: AuthSecret,
        config: SessionConfig,
    ) -> Self {
        let transport = TcpHttpTransport::new(host, port, config.timeout);
        Self::new(transport, auth_secret, config)
    }
}

impl<T: HttpTransport> SessionManager<T> {
    /// Creates a manager with no session.
    pub fn new(transport: T, auth_secret: AuthSecret, config: SessionConfig) -> Self {
        let engine = HandshakeEngine::new(&config);
        Self {
            transport,
            auth_secret,
            config,
            engine,
            state: Mutex::new(SessionState::NoSession),
        }
    }

    /// Replaces the source of handshake seeds.
    pub fn with_seed_source(mut self, seeds: Arc<dyn SeedSource>) -> Self {
        self.engine = self.engine.with_seed_source(seeds);
        self
    }

    /// Returns the transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Sends an opaque request and returns the decrypted response.
    ///
    /// Runs the handshake first if there is no session. Concurrent calls wait
    /// for each other.
    ///
    /// # Errors
    ///
    /// Handshake errors are returned as-is and leave no session behind.
    /// A non-200 request status is [`Error::Transport`] and keeps the session.
    /// [`Error::IntegrityFailure`] discards the session so the next call
    /// handshakes again.
    pub async fn send(&self, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
        let mut state = self.state.lock().await;

        // Taken out for the duration of the exchange; a cancelled send leaves
        // no session behind.
        let mut session = match std::mem::replace(&mut *state, SessionState::NoSession) {
            SessionState::Active(session) => session,
            SessionState::NoSession => self.establish().await?,
        };

        let result = self.exchange(&mut session, plaintext).await;
        match &result {
            Err(e) if e.invalidates_session() => {
                debug!(seq = session.codec.seq(), "discarding KLAP session");
            }
            _ => *state = SessionState::Active(session),
        }
        result
    }

    async fn establish(&self) -> Result<ActiveSession, Error> {
        let EstablishedSession { keys, cookies } = self
            .engine
            .establish(&self.transport, &self.auth_secret)
            .await?;
        let codec =
            SessionCodec::new(keys).with_signature_verification(self.config.verify_signatures);
        Ok(ActiveSession { codec, cookies })
    }

    async fn exchange(
        &self,
        session: &mut ActiveSession,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let (body, seq) = session.codec.encrypt(plaintext);
        debug!(seq, bytes = body.len(), "sending KLAP request");

        let request = HttpRequest::new(REQUEST_PATH, &body)
            .with_query(SEQ_PARAM, seq)
            .with_content_type(CONTENT_TYPE_JSON);
        let response = post_with_timeout(
            &self.transport,
            request,
            &mut session.cookies,
            self.config.timeout,
        )
        .await?;

        if !response.is_success() {
            return Err(Error::Transport(format!(
                "request seq {} returned status {}",
                seq, response.status
            )));
        }

        session.codec.decrypt(&response.body)
    }

    /// Drops the current session; the next [`send`](Self::send) handshakes again.
    pub async fn reset(&self) {
        *self.state.lock().await = SessionState::NoSession;
    }

    /// Returns `true` if a session is established.
    pub async fn is_established(&self) -> bool {
        matches!(*self.state.lock().await, SessionState::Active(_))
    }

    /// Returns the sequence number of the most recent request, if a session exists.
    pub async fn current_seq(&self) -> Option<i32> {
        match &*self.state.lock().await {
            SessionState::Active(session) => Some(session.codec.seq()),
            SessionState::NoSession => None,
        }
    }
}

impl<T> fmt::Debug for SessionManager<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("config", &self.config)
            .field("auth_secret", &self.auth_secret)
            .finish_non_exhaustive()
    }
}
