use async_trait::async_trait;

use crate::signal::record::SessionRecord;
use crate::signal::{IdentityKey, IdentityKeyPair};
use crate::store::error::Result;
use crate::types::address::{DeviceId, ProtocolAddress};

/// Long-term identity material: our own key pair and the remembered
/// public key of every address we have talked to. A remembered key that
/// stops matching what the server hands out is an identity change and
/// needs user-level confirmation before it may be overwritten.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn get_identity_key_pair(&self) -> Result<IdentityKeyPair>;
    async fn get_identity(&self, addr: &str) -> Result<Option<IdentityKey>>;
    async fn put_identity(&self, addr: &str, key: IdentityKey) -> Result<()>;
    async fn delete_identity(&self, addr: &str) -> Result<()>;
}

/// Session records keyed by the canonical `addr.deviceId` encoding.
/// The device-id list for an address is derived from the records, so
/// deleting a session forgets the device and storing one learns it.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get_device_ids(&self, addr: &str) -> Result<Vec<DeviceId>>;
    async fn get_session(&self, address: &ProtocolAddress) -> Result<Option<SessionRecord>>;
    async fn put_session(&self, address: &ProtocolAddress, record: &SessionRecord) -> Result<()>;
    /// Must tolerate a missing record.
    async fn delete_session(&self, address: &ProtocolAddress) -> Result<()>;
    async fn has_session(&self, address: &ProtocolAddress) -> Result<bool>;
}

pub trait Backend: IdentityStore + SessionStore + Send + Sync {}

impl<T> Backend for T where T: IdentityStore + SessionStore + Send + Sync {}
