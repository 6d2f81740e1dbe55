//! KLAP key schedule and session cipher.
//!
//! After a successful handshake both sides hold the client's local seed, the
//! device's remote seed, and the shared [`AuthSecret`]. Three SHA-256
//! derivations with distinct prefixes turn those into the session material:
//!
//! - `lsk`: 16-byte AES-128 key
//! - `iv`: 12-byte IV prefix, plus the initial sequence number from the next 4 bytes
//! - `ldk`: 28-byte signature key
//!
//! Every message is AES-128-CBC encrypted with IV `base_iv || be32(seq)` and
//! prefixed with `sha256(sig_key || be32(seq) || ciphertext)`.

use std::fmt;

use aes::Aes128;
use cbc::cipher::{
    BlockDecryptMut, BlockEncryptMut, KeyIvInit,
    block_padding::{NoPadding, Pkcs7},
};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::{credentials::AuthSecret, error::Error};

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Length of the local and remote handshake seeds.
pub const SEED_LEN: usize = 16;

/// Length of the signature prefixed to every encrypted message.
pub const SIGNATURE_LEN: usize = 32;

const KEY_LEN: usize = 16;
const BASE_IV_LEN: usize = 12;
const SIG_KEY_LEN: usize = 28;
const BLOCK_LEN: usize = 16;

fn sha256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Derives the authentication secret: `sha256(sha1(identity) + sha1(secret))`.
///
/// Inputs are treated as raw bytes; there is no encoding requirement.
///
/// # Example
///
/// ```
/// use klap_core::crypto::klap::derive_auth_secret;
///
/// let a = derive_auth_secret(b"user@example.com", b"hunter2");
/// let b = derive_auth_secret(b"user@example.com", b"hunter2");
/// assert_eq!(a, b);
/// assert_eq!(a.as_bytes().len(), 32);
/// ```
pub fn derive_auth_secret(identity: &[u8], secret: &[u8]) -> AuthSecret {
    let identity_hash = Sha1::digest(identity);
    let secret_hash = Sha1::digest(secret);
    AuthSecret::from_bytes(sha256(&[identity_hash.as_slice(), secret_hash.as_slice()]))
}

/// Proof the device returns in handshake 1: `sha256(local_seed + remote_seed + auth)`.
pub fn handshake1_server_proof(
    local_seed: &[u8; SEED_LEN],
    remote_seed: &[u8; SEED_LEN],
    auth_secret: &AuthSecret,
) -> [u8; 32] {
    sha256(&[local_seed, remote_seed, auth_secret.as_bytes()])
}

/// Proof the client sends in handshake 2: `sha256(remote_seed + local_seed + auth)`.
pub fn handshake2_client_proof(
    local_seed: &[u8; SEED_LEN],
    remote_seed: &[u8; SEED_LEN],
    auth_secret: &AuthSecret,
) -> [u8; 32] {
    sha256(&[remote_seed, local_seed, auth_secret.as_bytes()])
}

/// Symmetric material derived once per handshake.
///
/// The keys never change for the lifetime of a session. [`seal`](Self::seal)
/// and [`open`](Self::open) take the sequence number explicitly, which is what
/// a device-side peer needs; clients should go through [`SessionCodec`], which
/// owns the running counter.
#[derive(Clone)]
pub struct SessionKeys {
    enc_key: [u8; KEY_LEN],
    base_iv: [u8; BASE_IV_LEN],
    initial_seq: i32,
    sig_key: [u8; SIG_KEY_LEN],
}

impl SessionKeys {
    /// Derives session keys from both seeds and the shared secret.
    pub fn derive(
        local_seed: &[u8; SEED_LEN],
        remote_seed: &[u8; SEED_LEN],
        auth_secret: &AuthSecret,
    ) -> Self {
        let auth = auth_secret.as_bytes();
        let lsk = sha256(&[b"lsk", local_seed, remote_seed, auth]);
        let iv = sha256(&[b"iv", local_seed, remote_seed, auth]);
        let ldk = sha256(&[b"ldk", local_seed, remote_seed, auth]);

        let mut enc_key = [0u8; KEY_LEN];
        enc_key.copy_from_slice(&lsk[..KEY_LEN]);

        let mut base_iv = [0u8; BASE_IV_LEN];
        base_iv.copy_from_slice(&iv[..BASE_IV_LEN]);

        let initial_seq = i32::from_be_bytes([iv[12], iv[13], iv[14], iv[15]]);

        let mut sig_key = [0u8; SIG_KEY_LEN];
        sig_key.copy_from_slice(&ldk[..SIG_KEY_LEN]);

        Self {
            enc_key,
            base_iv,
            initial_seq,
            sig_key,
        }
    }

    /// AES-128 key.
    pub fn enc_key(&self) -> &[u8; KEY_LEN] {
        &self.enc_key
    }

    /// First 12 bytes of every IV.
    pub fn base_iv(&self) -> &[u8; BASE_IV_LEN] {
        &self.base_iv
    }

    /// Sequence number the counter starts from.
    pub fn initial_seq(&self) -> i32 {
        self.initial_seq
    }

    /// Key mixed into every message signature.
    pub fn sig_key(&self) -> &[u8; SIG_KEY_LEN] {
        &self.sig_key
    }

    fn iv_for_seq(&self, seq: i32) -> [u8; BLOCK_LEN] {
        let mut iv = [0u8; BLOCK_LEN];
        iv[..BASE_IV_LEN].copy_from_slice(&self.base_iv);
        iv[BASE_IV_LEN..].copy_from_slice(&seq.to_be_bytes());
        iv
    }

    fn signature(&self, seq: i32, ciphertext: &[u8]) -> [u8; SIGNATURE_LEN] {
        sha256(&[&self.sig_key, &seq.to_be_bytes(), ciphertext])
    }

    /// Encrypts and signs `plaintext` under `seq`, returning `signature || ciphertext`.
    pub fn seal(&self, seq: i32, plaintext: &[u8]) -> Vec<u8> {
        let ciphertext = Aes128CbcEnc::new(&self.enc_key.into(), &self.iv_for_seq(seq).into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut message = Vec::with_capacity(SIGNATURE_LEN + ciphertext.len());
        message.extend_from_slice(&self.signature(seq, &ciphertext));
        message.extend_from_slice(&ciphertext);
        message
    }

    /// Verifies (optionally) and decrypts a `signature || ciphertext` message under `seq`.
    ///
    /// # Errors
    ///
    /// - [`Error::MalformedResponse`] if the message is shorter than the
    ///   signature or the ciphertext is not whole AES blocks
    /// - [`Error::IntegrityFailure`] if `verify_signature` is set and the
    ///   signature does not match
    /// - [`Error::Padding`] if the padding length is impossible
    pub fn open(&self, seq: i32, message: &[u8], verify_signature: bool) -> Result<Vec<u8>, Error> {
        if message.len() < SIGNATURE_LEN {
            return Err(Error::MalformedResponse(format!(
                "message is {} bytes, shorter than the {}-byte signature",
                message.len(),
                SIGNATURE_LEN
            )));
        }

        let (signature, ciphertext) = message.split_at(SIGNATURE_LEN);

        if verify_signature {
            let expected = self.signature(seq, ciphertext);
            if !bool::from(expected[..].ct_eq(signature)) {
                return Err(Error::IntegrityFailure { seq });
            }
        }

        if ciphertext.len() % BLOCK_LEN != 0 {
            return Err(Error::MalformedResponse(format!(
                "ciphertext length {} is not a multiple of {}",
                ciphertext.len(),
                BLOCK_LEN
            )));
        }

        let mut plaintext = Aes128CbcDec::new(&self.enc_key.into(), &self.iv_for_seq(seq).into())
            .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
            .map_err(|e| Error::MalformedResponse(format!("decryption failed: {}", e)))?;

        let pad = match plaintext.last() {
            Some(&pad) => pad as usize,
            None => return Err(Error::Padding("decrypted payload is empty".into())),
        };
        if pad > plaintext.len() {
            return Err(Error::Padding(format!(
                "padding length {} exceeds payload length {}",
                pad,
                plaintext.len()
            )));
        }
        plaintext.truncate(plaintext.len() - pad);

        Ok(plaintext)
    }
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeys")
            .field("initial_seq", &self.initial_seq)
            .field("keys", &"[REDACTED]")
            .finish()
    }
}

/// Client-side session cipher with a running sequence counter.
///
/// Each [`encrypt`](Self::encrypt) advances the counter by one; the matching
/// [`decrypt`](Self::decrypt) reuses that value. Encrypt and decrypt must
/// therefore alternate one-to-one, which is why the codec is only reachable
/// through [`SessionManager`](crate::SessionManager) outside of tests.
pub struct SessionCodec {
    keys: SessionKeys,
    seq: i32,
    verify_signatures: bool,
}

impl SessionCodec {
    /// Creates a codec positioned at the keys' initial sequence number.
    ///
    /// Response signatures are verified by default.
    pub fn new(keys: SessionKeys) -> Self {
        Self {
            seq: keys.initial_seq(),
            keys,
            verify_signatures: true,
        }
    }

    /// Enables or disables response signature verification.
    ///
    /// With verification off, responses are decrypted without checking the
    /// signature prefix, as some third-party clients do.
    pub fn with_signature_verification(mut self, verify: bool) -> Self {
        self.verify_signatures = verify;
        self
    }

    /// Advances the counter and encrypts `plaintext`.
    ///
    /// Returns the request body and the sequence number to send with it.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> (Vec<u8>, i32) {
        self.seq = self.seq.wrapping_add(1);
        (self.keys.seal(self.seq, plaintext), self.seq)
    }

    /// Decrypts a response using the sequence number of the last encrypt.
    pub fn decrypt(&self, message: &[u8]) -> Result<Vec<u8>, Error> {
        self.keys.open(self.seq, message, self.verify_signatures)
    }

    /// Current sequence number.
    pub fn seq(&self) -> i32 {
        self.seq
    }

    /// The session keys this codec was built from.
    pub fn keys(&self) -> &SessionKeys {
        &self.keys
    }
}

impl fmt::Debug for SessionCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCodec")
            .field("seq", &self.seq)
            .field("verify_signatures", &self.verify_signatures)
            .field("keys", &"[REDACTED]")
            .finish()
    }
}
