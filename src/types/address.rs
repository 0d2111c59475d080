use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Device identifier within one recipient account. Wire representations
/// (string or integer) are canonicalised to this type at the boundary.
pub type DeviceId = u32;

/// The recipient's primary device. Never auto-pruned on a 404 during
/// per-device key fetches.
pub const PRIMARY_DEVICE_ID: DeviceId = 1;

/// One `(address, device)` endpoint. The `Display` form `addr.deviceId`
/// is the canonical key for session records in the store.
#[derive(Clone, Debug, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct ProtocolAddress {
    name: String,
    device_id: DeviceId,
}

impl ProtocolAddress {
    pub fn new(name: impl Into<String>, device_id: DeviceId) -> Self {
        ProtocolAddress {
            name: name.into(),
            device_id,
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }
}

impl fmt::Display for ProtocolAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.device_id)
    }
}

#[derive(Debug, Error)]
#[error("invalid protocol address: {0:?}")]
pub struct AddressParseError(String);

impl FromStr for ProtocolAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Addresses may themselves contain dots; the device id is the
        // suffix after the last one.
        let (name, device) = s
            .rsplit_once('.')
            .ok_or_else(|| AddressParseError(s.to_string()))?;
        if name.is_empty() {
            return Err(AddressParseError(s.to_string()));
        }
        let device_id = device
            .parse::<DeviceId>()
            .map_err(|_| AddressParseError(s.to_string()))?;
        Ok(ProtocolAddress::new(name, device_id))
    }
}
