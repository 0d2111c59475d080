// Outgoing secure-message dispatch core: device discovery, per-device
// session establishment, padded payload encryption, and the bounded
// 409/410 reconciliation loop around transmission.

pub mod credentials;
pub mod error;
pub mod messages;
pub mod send;
pub mod signal;
pub mod store;
pub mod test_utils;
pub mod transport;
pub mod types;

pub use error::DispatchError;
pub use send::OutgoingMessage;
pub use types::address::{DeviceId, ProtocolAddress, PRIMARY_DEVICE_ID};
pub use types::events::{DispatchEvent, EventHandler, IdentityKeyChange};
