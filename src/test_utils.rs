//! Mock seam implementations and store fixtures shared by unit and
//! integration tests.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::signal::record::{SessionRecord, SessionState};
use crate::signal::{IdentityKey, KeyPair};
use crate::store::memory::MemoryStore;
use crate::store::traits::SessionStore;
use crate::transport::{
    EncryptedDeviceMessage, PreKeyBundle, PreKeyEntry, PreKeyResponse, ProtocolError,
    SignalTransport, TransportError,
};
use crate::types::address::{DeviceId, ProtocolAddress};

/// One `send_messages` call as the mock transport saw it.
#[derive(Debug, Clone)]
pub struct RecordedSend {
    pub addr: String,
    pub messages: Vec<EncryptedDeviceMessage>,
    pub timestamp: u64,
}

/// Scripted outcome for one `send_messages` call.
pub enum SendOutcome {
    Ok,
    Status(u16, serde_json::Value),
    Network(&'static str),
}

/// Scripted outcome for a per-device key fetch.
pub enum KeyOutcome {
    Response(PreKeyResponse),
    Status(u16),
}

/// Scriptable transport double. Key responses are persistent (repeat
/// fetches see the same material); send outcomes are consumed in order,
/// defaulting to success once the script runs dry.
#[derive(Default)]
pub struct MockSignalTransport {
    full_keys: Mutex<HashMap<String, PreKeyResponse>>,
    device_keys: Mutex<HashMap<(String, DeviceId), KeyOutcome>>,
    send_script: Mutex<VecDeque<SendOutcome>>,
    sends: Mutex<Vec<RecordedSend>>,
    key_fetches: Mutex<Vec<(String, Option<DeviceId>)>>,
}

impl MockSignalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn expect_keys(&self, addr: &str, response: PreKeyResponse) {
        self.full_keys.lock().await.insert(addr.to_string(), response);
    }

    pub async fn expect_device_keys(&self, addr: &str, device_id: DeviceId, outcome: KeyOutcome) {
        self.device_keys
            .lock()
            .await
            .insert((addr.to_string(), device_id), outcome);
    }

    pub async fn push_send(&self, outcome: SendOutcome) {
        self.send_script.lock().await.push_back(outcome);
    }

    pub async fn recorded_sends(&self) -> Vec<RecordedSend> {
        self.sends.lock().await.clone()
    }

    pub async fn recorded_key_fetches(&self) -> Vec<(String, Option<DeviceId>)> {
        self.key_fetches.lock().await.clone()
    }
}

#[async_trait]
impl SignalTransport for MockSignalTransport {
    async fn get_keys_for_addr(
        &self,
        addr: &str,
        device_id: Option<DeviceId>,
    ) -> Result<PreKeyResponse, TransportError> {
        self.key_fetches
            .lock()
            .await
            .push((addr.to_string(), device_id));
        match device_id {
            None => self
                .full_keys
                .lock()
                .await
                .get(addr)
                .cloned()
                .ok_or_else(|| {
                    ProtocolError::new(404, serde_json::Value::Null).into()
                }),
            Some(device_id) => {
                match self
                    .device_keys
                    .lock()
                    .await
                    .get(&(addr.to_string(), device_id))
                {
                    Some(KeyOutcome::Response(response)) => Ok(response.clone()),
                    Some(KeyOutcome::Status(code)) => {
                        Err(ProtocolError::new(*code, serde_json::Value::Null).into())
                    }
                    None => Err(TransportError::network(anyhow::anyhow!(
                        "no scripted key response for {addr}.{device_id}"
                    ))),
                }
            }
        }
    }

    async fn send_messages(
        &self,
        addr: &str,
        messages: &[EncryptedDeviceMessage],
        timestamp: u64,
    ) -> Result<(), TransportError> {
        self.sends.lock().await.push(RecordedSend {
            addr: addr.to_string(),
            messages: messages.to_vec(),
            timestamp,
        });
        match self.send_script.lock().await.pop_front() {
            None | Some(SendOutcome::Ok) => Ok(()),
            Some(SendOutcome::Status(code, body)) => Err(ProtocolError::new(code, body).into()),
            Some(SendOutcome::Network(message)) => {
                Err(TransportError::network(anyhow::anyhow!(message)))
            }
        }
    }
}

/// Registration id convention used by the fixtures below.
pub fn registration_id_for(device_id: DeviceId) -> u32 {
    1000 + device_id
}

pub fn pre_key_bundle(device_id: DeviceId) -> PreKeyBundle {
    PreKeyBundle {
        device_id,
        registration_id: registration_id_for(device_id),
        signed_pre_key: PreKeyEntry {
            key_id: device_id * 10,
            public_key: KeyPair::generate().public_key,
        },
        pre_key: Some(PreKeyEntry {
            key_id: device_id * 10 + 1,
            public_key: KeyPair::generate().public_key,
        }),
    }
}

pub fn pre_key_response(identity_key: IdentityKey, device_ids: &[DeviceId]) -> PreKeyResponse {
    PreKeyResponse {
        identity_key,
        devices: device_ids.iter().map(|&id| pre_key_bundle(id)).collect(),
    }
}

fn session_state(device_id: DeviceId, remote_identity: IdentityKey) -> SessionState {
    SessionState {
        registration_id: registration_id_for(device_id),
        remote_identity,
        chain_key: [device_id as u8; 32],
        counter: 0,
        pending_pre_key: false,
    }
}

/// Store an established (acknowledged, open) session for one device.
pub async fn seed_open_session(
    store: &MemoryStore,
    addr: &str,
    device_id: DeviceId,
    remote_identity: IdentityKey,
) {
    let record = SessionRecord::new(session_state(device_id, remote_identity));
    store
        .put_session(&ProtocolAddress::new(addr, device_id), &record)
        .await
        .expect("seeding session");
}

/// Store a session whose state has been archived: the device is known
/// but a stale-device scan will flag it.
pub async fn seed_stale_session(
    store: &MemoryStore,
    addr: &str,
    device_id: DeviceId,
    remote_identity: IdentityKey,
) {
    let mut record = SessionRecord::new(session_state(device_id, remote_identity));
    record.close_open_state();
    store
        .put_session(&ProtocolAddress::new(addr, device_id), &record)
        .await
        .expect("seeding session");
}
