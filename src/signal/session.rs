use std::sync::Arc;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use x25519_dalek::x25519;

use crate::signal::record::SessionState;
use crate::signal::{
    IdentityKey, KeyPair, SignalError, CIPHERTEXT_MESSAGE_TYPE, PREKEY_MESSAGE_TYPE,
};
use crate::store::traits::Backend;
use crate::transport::PreKeyBundle;
use crate::types::address::ProtocolAddress;

const MESSAGE_VERSION: u8 = 3;
const MESSAGE_KEY_SEED: &[u8] = &[0x01];
const CHAIN_KEY_SEED: &[u8] = &[0x02];
const DISCONTINUITY: [u8; 32] = [0xFF; 32];
const SESSION_INFO: &[u8] = b"WhisperText";
const MESSAGE_KEYS_INFO: &[u8] = b"WhisperMessageKeys";

type HmacSha256 = Hmac<Sha256>;

fn hmac_sha256(key: &[u8; 32], data: &[u8]) -> [u8; 32] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Run the session builder over one fetched pre-key bundle: check
/// identity continuity, agree on a fresh sending chain, and promote the
/// new state into the stored record.
///
/// A first contact pins the fetched identity (trust on first use); a
/// mismatch against a pinned identity surfaces as
/// [`SignalError::UntrustedIdentity`] and must be confirmed by the user
/// before any session is built.
pub async fn process_pre_key(
    store: &dyn Backend,
    address: &ProtocolAddress,
    bundle: &PreKeyBundle,
    their_identity: &IdentityKey,
) -> Result<(), SignalError> {
    match store.get_identity(address.name()).await? {
        None => store.put_identity(address.name(), *their_identity).await?,
        Some(known) if known == *their_identity => {}
        Some(_) => {
            return Err(SignalError::UntrustedIdentity {
                addr: address.name().to_string(),
                identity_key: *their_identity,
            });
        }
    }

    let our_identity = store.get_identity_key_pair().await?;
    let ephemeral = KeyPair::generate();

    let mut secrets = Vec::with_capacity(32 * 5);
    secrets.extend_from_slice(&DISCONTINUITY);
    secrets.extend_from_slice(&x25519(
        our_identity.private_key,
        bundle.signed_pre_key.public_key,
    ));
    secrets.extend_from_slice(&x25519(ephemeral.private_key, their_identity.0));
    secrets.extend_from_slice(&x25519(
        ephemeral.private_key,
        bundle.signed_pre_key.public_key,
    ));
    if let Some(one_time) = &bundle.pre_key {
        secrets.extend_from_slice(&x25519(ephemeral.private_key, one_time.public_key));
    }

    let hk = Hkdf::<Sha256>::new(None, &secrets);
    let mut okm = [0u8; 64];
    hk.expand(SESSION_INFO, &mut okm)
        .map_err(|_| SignalError::Encryption("session key derivation".to_string()))?;
    let mut chain_key = [0u8; 32];
    chain_key.copy_from_slice(&okm[32..]);

    let state = SessionState {
        registration_id: bundle.registration_id,
        remote_identity: *their_identity,
        chain_key,
        counter: 0,
        pending_pre_key: true,
    };

    let mut record = store.get_session(address).await?.unwrap_or_default();
    record.promote_state(state);
    store.put_session(address, &record).await?;
    Ok(())
}

/// Ciphertext for one device, ready to wrap into the wire payload.
#[derive(Debug)]
pub struct EncryptedPayload {
    pub msg_type: u32,
    pub registration_id: u32,
    pub body: Vec<u8>,
}

/// Per-device encrypt/close handle over the stored session record.
/// Cheap to construct; a dispatch retains one per device for the
/// lifetime of a single transmit round.
pub struct SessionCipher {
    store: Arc<dyn Backend>,
    address: ProtocolAddress,
}

impl SessionCipher {
    pub fn new(store: Arc<dyn Backend>, address: ProtocolAddress) -> Self {
        Self { store, address }
    }

    pub fn address(&self) -> &ProtocolAddress {
        &self.address
    }

    pub async fn has_open_session(&self) -> Result<bool, SignalError> {
        Ok(self
            .store
            .get_session(&self.address)
            .await?
            .map(|record| record.has_open_state())
            .unwrap_or(false))
    }

    /// Encrypt one padded payload and advance the sending chain.
    pub async fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedPayload, SignalError> {
        let mut record = self
            .store
            .get_session(&self.address)
            .await?
            .ok_or_else(|| SignalError::NoOpenSession(self.address.clone()))?;

        let payload = {
            let state = record
                .open_state_mut()
                .ok_or_else(|| SignalError::NoOpenSession(self.address.clone()))?;

            let message_seed = hmac_sha256(&state.chain_key, MESSAGE_KEY_SEED);
            let hk = Hkdf::<Sha256>::new(None, &message_seed);
            let mut okm = [0u8; 44];
            hk.expand(MESSAGE_KEYS_INFO, &mut okm)
                .map_err(|_| SignalError::Encryption("message key derivation".to_string()))?;

            let cipher = Aes256Gcm::new_from_slice(&okm[..32])
                .map_err(|_| SignalError::Encryption("cipher key length".to_string()))?;
            let ciphertext = cipher
                .encrypt(Nonce::from_slice(&okm[32..]), plaintext)
                .map_err(|_| SignalError::Encryption("payload encryption".to_string()))?;

            let mut body = Vec::with_capacity(5 + ciphertext.len());
            body.push(MESSAGE_VERSION);
            body.extend_from_slice(&state.counter.to_be_bytes());
            body.extend_from_slice(&ciphertext);

            let msg_type = if state.pending_pre_key {
                PREKEY_MESSAGE_TYPE
            } else {
                CIPHERTEXT_MESSAGE_TYPE
            };
            let payload = EncryptedPayload {
                msg_type,
                registration_id: state.registration_id,
                body,
            };

            state.chain_key = hmac_sha256(&state.chain_key, CHAIN_KEY_SEED);
            state.counter += 1;
            payload
        };

        self.store.put_session(&self.address, &record).await?;
        Ok(payload)
    }

    /// Archive the open session state, if any. The next key fetch for
    /// this device starts a fresh chain.
    pub async fn close_open_session(&self) -> Result<(), SignalError> {
        if let Some(mut record) = self.store.get_session(&self.address).await? {
            record.close_open_state();
            self.store.put_session(&self.address, &record).await?;
        }
        Ok(())
    }
}
