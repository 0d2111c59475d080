use async_trait::async_trait;
use base64::prelude::BASE64_STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

use crate::signal::IdentityKey;
use crate::types::address::DeviceId;

/// One public pre-key as handed out by the server.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreKeyEntry {
    pub key_id: u32,
    pub public_key: [u8; 32],
}

/// Bootstrap material for one device. Consumed by the session builder
/// and discarded.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreKeyBundle {
    pub device_id: DeviceId,
    pub registration_id: u32,
    pub signed_pre_key: PreKeyEntry,
    /// One-time pre-key; the server may have run out.
    pub pre_key: Option<PreKeyEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreKeyResponse {
    pub identity_key: IdentityKey,
    pub devices: Vec<PreKeyBundle>,
}

fn as_base64<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&BASE64_STANDARD.encode(bytes))
}

/// Wire payload for one device. Field names and the base64 content
/// encoding are server-compatible and must not change.
#[derive(Debug, Clone, Serialize)]
pub struct EncryptedDeviceMessage {
    #[serde(rename = "type")]
    pub msg_type: u32,
    #[serde(rename = "destinationDeviceId")]
    pub destination_device_id: DeviceId,
    #[serde(rename = "destinationRegistrationId")]
    pub destination_registration_id: u32,
    #[serde(serialize_with = "as_base64")]
    pub content: Vec<u8>,
}

/// Device-set diff carried by a 409 response.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MismatchedDevices {
    #[serde(default)]
    pub extra_devices: Vec<DeviceId>,
    #[serde(default)]
    pub missing_devices: Vec<DeviceId>,
}

/// Stale-session set carried by a 410 response.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaleDevices {
    #[serde(default)]
    pub stale_devices: Vec<DeviceId>,
}

/// Status-coded rejection from the server, with whatever structured
/// body it sent along.
#[derive(Debug, Error)]
#[error("server returned status {code}")]
pub struct ProtocolError {
    pub code: u16,
    pub response: serde_json::Value,
}

impl ProtocolError {
    pub fn new(code: u16, response: serde_json::Value) -> Self {
        Self { code, response }
    }

    /// Typed view of a 409 body. `None` when the body does not parse.
    pub fn mismatched_devices(&self) -> Option<MismatchedDevices> {
        serde_json::from_value(self.response.clone()).ok()
    }

    /// Typed view of a 410 body. `None` when the body does not parse.
    pub fn stale_devices(&self) -> Option<StaleDevices> {
        serde_json::from_value(self.response.clone()).ok()
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Connection-level failure. Callers treat these as retriable later
    /// and they propagate unchanged through the dispatch.
    #[error("network failure: {0}")]
    Network(anyhow::Error),
}

impl TransportError {
    pub fn network(err: impl Into<anyhow::Error>) -> Self {
        Self::Network(err.into())
    }
}

/// Typed RPC surface of the message server.
#[async_trait]
pub trait SignalTransport: Send + Sync {
    /// Fetch pre-key bundles for an address: all devices when
    /// `device_id` is `None`, one device otherwise.
    async fn get_keys_for_addr(
        &self,
        addr: &str,
        device_id: Option<DeviceId>,
    ) -> Result<PreKeyResponse, TransportError>;

    /// Post one recipient's ciphertext bundle. `timestamp` is the
    /// dispatch timestamp the server deduplicates on.
    async fn send_messages(
        &self,
        addr: &str,
        messages: &[EncryptedDeviceMessage],
        timestamp: u64,
    ) -> Result<(), TransportError>;
}
