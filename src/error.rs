use std::sync::Arc;

use thiserror::Error;

use crate::signal::SignalError;
use crate::store::error::StoreError;
use crate::transport::{ProtocolError, TransportError};
use crate::types::events::IdentityKeyChange;

/// Failure of one dispatch path. Error entries carry one of these as the
/// cause; the entry itself holds the address, reason tag and timestamp.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The server does not know the address at all.
    #[error("address {addr} is not registered")]
    UnregisteredUser {
        addr: String,
        #[source]
        source: ProtocolError,
    },

    /// Status-coded rejection that is neither a device-set signal nor a
    /// 404: not retriable.
    #[error("server rejected message for {addr}")]
    SendRejected {
        addr: String,
        #[source]
        source: ProtocolError,
    },

    /// The recipient's identity key rotated and the change was not
    /// accepted.
    #[error("identity key for {} has changed", .0.addr())]
    IdentityChanged(Arc<IdentityKeyChange>),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("network failure: {0}")]
    Network(anyhow::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Signal(#[from] SignalError),
}

impl From<TransportError> for DispatchError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Protocol(protocol) => DispatchError::Protocol(protocol),
            TransportError::Network(network) => DispatchError::Network(network),
        }
    }
}
