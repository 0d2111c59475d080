pub mod record;
pub mod session;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::error::StoreError;
use crate::types::address::ProtocolAddress;

/// Envelope type for a message that rides an established session.
pub const CIPHERTEXT_MESSAGE_TYPE: u32 = 1;
/// Envelope type for a message that bootstraps the session from a
/// pre-key bundle. Sessions we initiate stay in this mode until the
/// peer acknowledges.
pub const PREKEY_MESSAGE_TYPE: u32 = 3;

/// Long-term public key of one address, compared bytewise for the
/// identity-continuity check.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityKey(pub [u8; 32]);

#[derive(Debug, Clone)]
pub struct KeyPair {
    pub public_key: [u8; 32],
    pub private_key: [u8; 32],
}

impl KeyPair {
    pub fn generate() -> Self {
        let mut private_key = [0u8; 32];
        OsRng.fill_bytes(&mut private_key);
        // x25519 clamps the scalar internally.
        let public_key = x25519_dalek::x25519(private_key, x25519_dalek::X25519_BASEPOINT_BYTES);
        Self {
            public_key,
            private_key,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IdentityKeyPair {
    pub public_key: IdentityKey,
    pub private_key: [u8; 32],
}

impl IdentityKeyPair {
    pub fn generate() -> Self {
        let pair = KeyPair::generate();
        Self {
            public_key: IdentityKey(pair.public_key),
            private_key: pair.private_key,
        }
    }
}

#[derive(Debug, Error)]
pub enum SignalError {
    /// The fetched identity key does not match the one remembered for
    /// this address. Carries the new key so the caller can prompt.
    #[error("identity key for {addr} has changed")]
    UntrustedIdentity {
        addr: String,
        identity_key: IdentityKey,
    },

    #[error("no open session with {0}")]
    NoOpenSession(ProtocolAddress),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}
