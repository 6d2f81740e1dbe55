//! Two-round KLAP handshake.
//!
//! 1. **Handshake 1**: the client POSTs a fresh 16-byte local seed. The device
//!    answers with its 16-byte remote seed followed by a 32-byte proof
//!    `sha256(local_seed + remote_seed + auth_secret)`, and sets the session
//!    cookie.
//! 2. **Handshake 2**: the client POSTs `sha256(remote_seed + local_seed + auth_secret)`
//!    with the cookie attached. The device only answers `200` if its own view
//!    of the secret produces the same value, so a rejection here means the
//!    credentials are wrong.
//!
//! Both seeds and the secret then feed [`SessionKeys::derive`]. Nothing is
//! kept from a failed attempt; the next attempt starts over with a new seed.

use std::{fmt, sync::Arc, time::Duration};

use rand::{TryRngCore, rngs::OsRng};
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::{
    credentials::AuthSecret,
    crypto::klap::{SEED_LEN, SessionKeys, handshake1_server_proof, handshake2_client_proof},
    error::Error,
    session::SessionConfig,
    transport::{
        HANDSHAKE1_PATH, HANDSHAKE2_PATH, HttpRequest, HttpTransport, SessionCookies,
        post_with_timeout,
    },
};

/// Length of the proof the device returns in handshake 1.
pub const SERVER_PROOF_LEN: usize = 32;

/// Source of local seeds.
pub trait SeedSource: Send + Sync {
    /// Fills `seed` with fresh random bytes.
    fn fill_seed(&self, seed: &mut [u8; SEED_LEN]) -> Result<(), Error>;
}

/// Seeds from the operating system's CSPRNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsSeedSource;

impl SeedSource for OsSeedSource {
    fn fill_seed(&self, seed: &mut [u8; SEED_LEN]) -> Result<(), Error> {
        OsRng
            .try_fill_bytes(seed)
            .map_err(|e| Error::RandomnessUnavailable(e.to_string()))
    }
}

/// Result of handshake 1.
#[derive(Debug)]
pub struct Handshake1 {
    /// Seed contributed by the device.
    pub remote_seed: [u8; SEED_LEN],
    /// The device's proof over both seeds and its secret.
    pub server_proof: [u8; SERVER_PROOF_LEN],
    /// Cookies issued by the device, to be echoed from now on.
    pub cookies: SessionCookies,
}

/// Material for a new session after both rounds succeeded.
#[derive(Debug)]
pub struct EstablishedSession {
    /// Derived session keys.
    pub keys: SessionKeys,
    /// Cookies tying requests to this handshake.
    pub cookies: SessionCookies,
}

/// Runs handshakes against a device.
pub struct HandshakeEngine {
    seeds: Arc<dyn SeedSource>,
    timeout: Duration,
    delay: Duration,
    strict_server_proof: bool,
}

impl HandshakeEngine {
    /// Creates an engine using the timeout, inter-round delay, and proof
    /// policy from `config`, with seeds from the OS.
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            seeds: Arc::new(OsSeedSource),
            timeout: config.timeout,
            delay: config.handshake_delay,
            strict_server_proof: config.strict_server_proof,
        }
    }

    /// Replaces the seed source.
    pub fn with_seed_source(mut self, seeds: Arc<dyn SeedSource>) -> Self {
        self.seeds = seeds;
        self
    }

    /// Performs handshake 1: send the local seed, receive remote seed and proof.
    ///
    /// The response body must be exactly 48 bytes. Trailing bytes after the
    /// proof are rejected rather than ignored.
    ///
    /// # Errors
    ///
    /// - [`Error::Transport`] on network failure, timeout, or non-200 status
    /// - [`Error::MalformedResponse`] if the body is not a 16-byte seed
    ///   followed by a 32-byte proof
    pub async fn handshake1<T: HttpTransport + ?Sized>(
        &self,
        transport: &T,
        local_seed: &[u8; SEED_LEN],
    ) -> Result<Handshake1, Error> {
        debug!(local_seed = %hex::encode(local_seed), "performing KLAP handshake1");

        let mut cookies = SessionCookies::new();
        let response = post_with_timeout(
            transport,
            HttpRequest::new(HANDSHAKE1_PATH, local_seed),
            &mut cookies,
            self.timeout,
        )
        .await?;

        if !response.is_success() {
            return Err(Error::Transport(format!(
                "handshake1 returned status {}",
                response.status
            )));
        }

        if response.body.len() != SEED_LEN + SERVER_PROOF_LEN {
            return Err(Error::MalformedResponse(format!(
                "handshake1 response has unexpected length: {} (expected {})",
                response.body.len(),
                SEED_LEN + SERVER_PROOF_LEN
            )));
        }

        let mut remote_seed = [0u8; SEED_LEN];
        let mut server_proof = [0u8; SERVER_PROOF_LEN];
        remote_seed.copy_from_slice(&response.body[..SEED_LEN]);
        server_proof.copy_from_slice(&response.body[SEED_LEN..]);

        debug!(
            remote_seed = %hex::encode(remote_seed),
            has_cookie = !cookies.is_empty(),
            "handshake1 received response"
        );

        Ok(Handshake1 {
            remote_seed,
            server_proof,
            cookies,
        })
    }

    /// Performs handshake 2 and derives the session keys.
    ///
    /// # Errors
    ///
    /// - [`Error::Transport`] on network failure or timeout
    /// - [`Error::AuthenticationFailed`] on any non-200 status
    pub async fn handshake2<T: HttpTransport + ?Sized>(
        &self,
        transport: &T,
        local_seed: &[u8; SEED_LEN],
        remote_seed: &[u8; SEED_LEN],
        auth_secret: &AuthSecret,
        cookies: &mut SessionCookies,
    ) -> Result<SessionKeys, Error> {
        debug!("performing KLAP handshake2");

        let proof = handshake2_client_proof(local_seed, remote_seed, auth_secret);
        let response = post_with_timeout(
            transport,
            HttpRequest::new(HANDSHAKE2_PATH, &proof),
            cookies,
            self.timeout,
        )
        .await?;

        if !response.is_success() {
            return Err(Error::AuthenticationFailed(format!(
                "handshake2 returned status {}",
                response.status
            )));
        }

        Ok(SessionKeys::derive(local_seed, remote_seed, auth_secret))
    }

    /// Runs both rounds with a fresh local seed.
    pub async fn establish<T: HttpTransport + ?Sized>(
        &self,
        transport: &T,
        auth_secret: &AuthSecret,
    ) -> Result<EstablishedSession, Error> {
        let mut local_seed = [0u8; SEED_LEN];
        self.seeds.fill_seed(&mut local_seed)?;

        let Handshake1 {
            remote_seed,
            server_proof,
            mut cookies,
        } = self.handshake1(transport, &local_seed).await?;

        if self.strict_server_proof {
            let expected = handshake1_server_proof(&local_seed, &remote_seed, auth_secret);
            if !bool::from(expected[..].ct_eq(&server_proof[..])) {
                return Err(Error::AuthenticationFailed(
                    "handshake1 proof does not match the local auth secret".into(),
                ));
            }
        }

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let keys = self
            .handshake2(
                transport,
                &local_seed,
                &remote_seed,
                auth_secret,
                &mut cookies,
            )
            .await?;

        debug!(initial_seq = keys.initial_seq(), "KLAP handshake completed");

        Ok(EstablishedSession { keys, cookies })
    }
}

impl fmt::Debug for HandshakeEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeEngine")
            .field("timeout", &self.timeout)
            .field("delay", &self.delay)
            .field("strict_server_proof", &self.strict_server_proof)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Credentials,
        testing::{Behavior, SimulatedDevice},
        transport::SESSION_COOKIE_NAME,
    };

    struct FixedSeed([u8; SEED_LEN]);

    impl SeedSource for FixedSeed {
        fn fill_seed(&self, seed: &mut [u8; SEED_LEN]) -> Result<(), Error> {
            *seed = self.0;
            Ok(())
        }
    }

    struct BrokenRng;

    impl SeedSource for BrokenRng {
        fn fill_seed(&self, _seed: &mut [u8; SEED_LEN]) -> Result<(), Error> {
            Err(Error::RandomnessUnavailable("entropy pool closed".into()))
        }
    }

    fn secret() -> AuthSecret {
        Credentials::new("user@example.com", "hunter2").auth_secret()
    }

    fn other_secret() -> AuthSecret {
        Credentials::new("user@example.com", "other").auth_secret()
    }

    fn engine() -> HandshakeEngine {
        HandshakeEngine::new(&SessionConfig::default())
    }

    #[test]
    fn test_os_seed_source_fills_seed() {
        let mut a = [0u8; SEED_LEN];
        let mut b = [0u8; SEED_LEN];
        OsSeedSource.fill_seed(&mut a).unwrap();
        OsSeedSource.fill_seed(&mut b).unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_establish_succeeds_and_keys_match_device() {
        let device = SimulatedDevice::new(secret());
        let engine = engine().with_seed_source(Arc::new(FixedSeed([0x42; SEED_LEN])));

        let session = engine.establish(&device, &secret()).await.unwrap();

        assert_eq!(device.handshake1_count(), 1);
        assert_eq!(device.handshake2_count(), 1);
        assert_eq!(session.cookies.get(SESSION_COOKIE_NAME), Some("SIM0001"));

        let expected = SessionKeys::derive(&[0x42; SEED_LEN], &[0x11; SEED_LEN], &secret());
        assert_eq!(session.keys.enc_key(), expected.enc_key());
        assert_eq!(session.keys.initial_seq(), expected.initial_seq());
    }

    #[tokio::test]
    async fn test_handshake1_parses_seed_and_proof() {
        let device = SimulatedDevice::new(secret());
        let local = [0x01; SEED_LEN];

        let result = engine().handshake1(&device, &local).await.unwrap();

        assert_eq!(result.remote_seed, [0x11; SEED_LEN]);
        assert_eq!(
            result.server_proof,
            handshake1_server_proof(&local, &result.remote_seed, &secret())
        );
        assert!(!result.cookies.is_empty());
    }

    #[tokio::test]
    async fn test_handshake1_non_success_is_transport_error() {
        let device = SimulatedDevice::new(secret());
        device.set_behavior(Behavior {
            handshake1_status: Some(500),
            ..Default::default()
        });

        let err = engine().establish(&device, &secret()).await.unwrap_err();
        assert!(matches!(err, Error::Transport(msg) if msg.contains("500")));
        assert_eq!(device.handshake2_count(), 0);
    }

    #[tokio::test]
    async fn test_handshake1_short_body_is_malformed() {
        let device = SimulatedDevice::new(secret());
        device.set_behavior(Behavior {
            handshake1_body_len: Some(20),
            ..Default::default()
        });

        let err = engine().establish(&device, &secret()).await.unwrap_err();
        assert!(matches!(err, Error::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn test_handshake1_trailing_bytes_are_malformed() {
        let device = SimulatedDevice::new(secret());
        device.set_behavior(Behavior {
            handshake1_body_len: Some(49),
            ..Default::default()
        });

        let err = engine().establish(&device, &secret()).await.unwrap_err();
        assert!(matches!(err, Error::MalformedResponse(msg) if msg.contains("49")));
        assert_eq!(device.handshake2_count(), 0);
    }

    #[tokio::test]
    async fn test_wrong_secret_fails_in_handshake2() {
        let device = SimulatedDevice::new(other_secret());

        let err = engine().establish(&device, &secret()).await.unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailed(msg) if msg.contains("403")));
        assert_eq!(device.handshake2_count(), 1);
    }

    #[tokio::test]
    async fn test_strict_proof_rejects_before_handshake2() {
        let device = SimulatedDevice::new(other_secret());
        let config = SessionConfig::default().with_strict_server_proof(true);
        let engine = HandshakeEngine::new(&config);

        let err = engine.establish(&device, &secret()).await.unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailed(_)));
        assert_eq!(device.handshake1_count(), 1);
        assert_eq!(device.handshake2_count(), 0);
    }

    #[tokio::test]
    async fn test_strict_proof_accepts_matching_device() {
        let device = SimulatedDevice::new(secret());
        let config = SessionConfig::default().with_strict_server_proof(true);
        let engine = HandshakeEngine::new(&config);

        engine.establish(&device, &secret()).await.unwrap();
        assert_eq!(device.handshake2_count(), 1);
    }

    #[tokio::test]
    async fn test_lenient_proof_ignores_bad_server_proof() {
        let device = SimulatedDevice::new(secret());
        device.set_behavior(Behavior {
            bad_server_proof: true,
            ..Default::default()
        });

        engine().establish(&device, &secret()).await.unwrap();
    }

    #[tokio::test]
    async fn test_randomness_failure_aborts_before_network() {
        let device = SimulatedDevice::new(secret());
        let engine = engine().with_seed_source(Arc::new(BrokenRng));

        let err = engine.establish(&device, &secret()).await.unwrap_err();
        assert!(matches!(err, Error::RandomnessUnavailable(_)));
        assert_eq!(device.handshake1_count(), 0);
    }

    #[tokio::test]
    async fn test_handshake2_without_cookie_is_rejected() {
        let device = SimulatedDevice::new(secret());
        let local = [0x05; SEED_LEN];
        let round1 = engine().handshake1(&device, &local).await.unwrap();

        let err = engine()
            .handshake2(
                &device,
                &local,
                &round1.remote_seed,
                &secret(),
                &mut SessionCookies::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_delay_is_applied() {
        let device = SimulatedDevice::new(secret());
        let engine = HandshakeEngine::new(
            &SessionConfig::default().with_handshake_delay(Duration::from_secs(2)),
        );

        let start = tokio::time::Instant::now();
        engine.establish(&device, &secret()).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_fresh_seed_per_attempt() {
        let device = SimulatedDevice::new(secret());
        let engine = engine();

        engine.establish(&device, &secret()).await.unwrap();
        engine.establish(&device, &secret()).await.unwrap();

        let seeds = device.handshake1_bodies();
        assert_eq!(seeds.len(), 2);
        assert!(seeds.iter().all(|seed| seed.len() == SEED_LEN));
        assert_ne!(seeds[0], seeds[1]);
    }

    #[tokio::test]
    async fn test_retry_after_failed_attempt_uses_new_seed() {
        let device = SimulatedDevice::new(secret());
        device.set_behavior(Behavior {
            reject_handshake2: true,
            ..Default::default()
        });
        let engine = engine();

        let err = engine.establish(&device, &secret()).await.unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailed(_)));

        device.set_behavior(Behavior::default());
        engine.establish(&device, &secret()).await.unwrap();

        let seeds = device.handshake1_bodies();
        assert_eq!(seeds.len(), 2);
        assert_ne!(seeds[0], seeds[1]);
    }
}
