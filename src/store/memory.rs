use async_trait::async_trait;

use crate::signal::record::SessionRecord;
use crate::signal::{IdentityKey, IdentityKeyPair};
use crate::store::error::Result;
use crate::store::generic::GenericMemoryStore;
use crate::store::traits::{IdentityStore, SessionStore};
use crate::types::address::{DeviceId, ProtocolAddress};

type IdentityMap = GenericMemoryStore<String, IdentityKey>;
type SessionMap = GenericMemoryStore<String, SessionRecord>;

/// In-memory `Backend` for tests and embedders that bring no database.
pub struct MemoryStore {
    identity_key_pair: IdentityKeyPair,
    identities: IdentityMap,
    sessions: SessionMap,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            identity_key_pair: IdentityKeyPair::generate(),
            identities: IdentityMap::new(),
            sessions: SessionMap::new(),
        }
    }
}

#[async_trait]
impl IdentityStore for MemoryStore {
    async fn get_identity_key_pair(&self) -> Result<IdentityKeyPair> {
        Ok(self.identity_key_pair.clone())
    }

    async fn get_identity(&self, addr: &str) -> Result<Option<IdentityKey>> {
        Ok(self.identities.get(&addr.to_string()).await)
    }

    async fn put_identity(&self, addr: &str, key: IdentityKey) -> Result<()> {
        self.identities.put(addr.to_string(), key).await;
        Ok(())
    }

    async fn delete_identity(&self, addr: &str) -> Result<()> {
        self.identities.remove(&addr.to_string()).await;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn get_device_ids(&self, addr: &str) -> Result<Vec<DeviceId>> {
        let mut ids: Vec<DeviceId> = self
            .sessions
            .keys()
            .await
            .iter()
            .filter_map(|key| key.parse::<ProtocolAddress>().ok())
            .filter(|parsed| parsed.name() == addr)
            .map(|parsed| parsed.device_id())
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn get_session(&self, address: &ProtocolAddress) -> Result<Option<SessionRecord>> {
        Ok(self.sessions.get(&address.to_string()).await)
    }

    async fn put_session(&self, address: &ProtocolAddress, record: &SessionRecord) -> Result<()> {
        self.sessions.put(address.to_string(), record.clone()).await;
        Ok(())
    }

    async fn delete_session(&self, address: &ProtocolAddress) -> Result<()> {
        self.sessions.remove(&address.to_string()).await;
        Ok(())
    }

    async fn has_session(&self, address: &ProtocolAddress) -> Result<bool> {
        Ok(self.sessions.contains(&address.to_string()).await)
    }
}
