//! Cryptographic primitives for KLAP sessions.
//!
//! - [`klap`]: credential hashing, handshake proofs, session key schedule,
//!   and the sequence-numbered AES-CBC session cipher

pub mod klap;

pub use klap::{
    SEED_LEN, SIGNATURE_LEN, SessionCodec, SessionKeys, derive_auth_secret,
    handshake1_server_proof, handshake2_client_proof,
};
