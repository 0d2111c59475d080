use serde::{Deserialize, Serialize};

use crate::signal::IdentityKey;

/// Sending half of one ratchet epoch with a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub registration_id: u32,
    pub remote_identity: IdentityKey,
    pub chain_key: [u8; 32],
    pub counter: u32,
    /// Still waiting for the peer to acknowledge the pre-key bootstrap;
    /// outgoing messages use the pre-key envelope type while set.
    pub pending_pre_key: bool,
}

/// Persistent session for one `(address, device)` pair: at most one open
/// state plus the closed states that preceded it. Serialises with serde
/// so persistence adapters can store it as an opaque blob.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionRecord {
    current: Option<SessionState>,
    closed: Vec<SessionState>,
}

impl SessionRecord {
    pub fn new(state: SessionState) -> Self {
        Self {
            current: Some(state),
            closed: Vec::new(),
        }
    }

    pub fn has_open_state(&self) -> bool {
        self.current.is_some()
    }

    pub fn open_state(&self) -> Option<&SessionState> {
        self.current.as_ref()
    }

    pub fn open_state_mut(&mut self) -> Option<&mut SessionState> {
        self.current.as_mut()
    }

    /// Close whatever is open and make `state` the open state.
    pub fn promote_state(&mut self, state: SessionState) {
        self.close_open_state();
        self.current = Some(state);
    }

    /// Archive the open state. The device stays known; the next dispatch
    /// sees it as stale and refreshes its keys.
    pub fn close_open_state(&mut self) {
        if let Some(state) = self.current.take() {
            self.closed.push(state);
        }
    }
}
