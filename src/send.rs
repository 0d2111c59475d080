use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures_util::future;
use log::{debug, warn};
use tokio::sync::Mutex;

use crate::error::DispatchError;
use crate::messages::MessageUtils;
use crate::signal::session::{process_pre_key, SessionCipher};
use crate::signal::SignalError;
use crate::store::traits::Backend;
use crate::transport::{EncryptedDeviceMessage, SignalTransport, TransportError};
use crate::types::address::{DeviceId, ProtocolAddress, PRIMARY_DEVICE_ID};
use crate::types::events::{
    DispatchEvent, ErrorEntry, EventBus, EventHandler, IdentityKeyChange, SentEntry,
};

/// One outgoing dispatch: a serialized plaintext, the timestamp the
/// server deduplicates on, and the observer registry. Single-use; after
/// the terminal event for a recipient the value can be dropped.
///
/// All outcomes are delivered through events, never as return values:
/// exactly one `Sent`, or one or more `Error` entries, per
/// [`send_to_addr`](Self::send_to_addr) call. Handlers must be
/// registered before dispatching.
pub struct OutgoingMessage {
    transport: Arc<dyn SignalTransport>,
    store: Arc<dyn Backend>,
    timestamp: u64,
    content: Vec<u8>,
    sent: Mutex<Vec<Arc<SentEntry>>>,
    errors: Mutex<Vec<Arc<ErrorEntry>>>,
    events: EventBus,
}

impl OutgoingMessage {
    pub fn new(
        transport: Arc<dyn SignalTransport>,
        store: Arc<dyn Backend>,
        timestamp: u64,
        content: Vec<u8>,
    ) -> Self {
        Self {
            transport,
            store,
            timestamp,
            content,
            sent: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
            events: EventBus::new(),
        }
    }

    /// The dispatch timestamp. Immutable across every retry.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub async fn add_event_handler(&self, handler: EventHandler) -> usize {
        self.events.add_handler(handler).await
    }

    pub async fn remove_event_handler(&self, id: usize) -> bool {
        self.events.remove_handler(id).await
    }

    pub async fn sent_entries(&self) -> Vec<Arc<SentEntry>> {
        self.sent.lock().await.clone()
    }

    pub async fn error_entries(&self) -> Vec<Arc<ErrorEntry>> {
        self.errors.lock().await.clone()
    }

    /// Dispatch to one recipient. Never raises; every outcome arrives as
    /// a `Sent` or `Error` event.
    pub async fn send_to_addr(&self, addr: &str) {
        let stale_ids = match self.get_stale_device_ids_for_addr(addr).await {
            Ok(ids) => ids,
            Err(e) => {
                return self
                    .register_error(addr, format!("Failed to get device ids for address {addr}"), e)
                    .await;
            }
        };
        if let Err(e) = self.get_keys_inner(addr, Some(&stale_ids), false).await {
            return self
                .register_error(
                    addr,
                    format!("Failed to retrieve new device keys for address {addr}"),
                    e,
                )
                .await;
        }
        if let Err(e) = self.reload_devices_and_send(addr, true).await {
            self.register_error(addr, format!("Failed to send to address {addr}"), e)
                .await;
        }
    }

    /// Locally-known devices whose session has no open state. An empty
    /// device list yields an empty result; the first transmit will then
    /// come back 409 with the server's authoritative set.
    pub async fn get_stale_device_ids_for_addr(
        &self,
        addr: &str,
    ) -> Result<Vec<DeviceId>, DispatchError> {
        let device_ids = self.store.get_device_ids(addr).await?;
        let mut stale = Vec::new();
        for device_id in device_ids {
            let cipher =
                SessionCipher::new(self.store.clone(), ProtocolAddress::new(addr, device_id));
            if !cipher.has_open_session().await? {
                stale.push(device_id);
            }
        }
        Ok(stale)
    }

    /// Forget sessions for the given devices. Missing records are fine.
    pub async fn remove_device_ids_for_addr(
        &self,
        addr: &str,
        device_ids: &[DeviceId],
    ) -> Result<(), DispatchError> {
        for &device_id in device_ids {
            self.store
                .delete_session(&ProtocolAddress::new(addr, device_id))
                .await?;
        }
        Ok(())
    }

    /// Fetch pre-key bundles and build sessions: the full device set
    /// when `update_devices` is `None`, otherwise exactly the listed
    /// devices. Identity rotations surface as a `KeyChange` event with
    /// one reentrant retry once accepted.
    pub async fn get_keys_for_addr(
        &self,
        addr: &str,
        update_devices: Option<&[DeviceId]>,
    ) -> Result<(), DispatchError> {
        self.get_keys_inner(addr, update_devices, false).await
    }

    async fn get_keys_inner(
        &self,
        addr: &str,
        update_devices: Option<&[DeviceId]>,
        reentrant: bool,
    ) -> Result<(), DispatchError> {
        match self.build_sessions(addr, update_devices).await {
            Ok(()) => Ok(()),
            Err(DispatchError::Signal(SignalError::UntrustedIdentity { identity_key, .. })) => {
                let change = Arc::new(IdentityKeyChange::new(addr, identity_key));
                if reentrant {
                    // One prompt per address per dispatch; a second
                    // rotation mid-retry is terminal.
                    return Err(DispatchError::IdentityChanged(change));
                }
                self.events
                    .dispatch(&DispatchEvent::KeyChange(change.clone()))
                    .await;
                if !change.is_accepted() {
                    return Err(DispatchError::IdentityChanged(change));
                }
                debug!(target: "Dispatch/Keys", "accepted new identity key for {addr}");
                self.store
                    .put_identity(addr, *change.identity_key())
                    .await?;
                Box::pin(self.get_keys_inner(addr, update_devices, true)).await
            }
            Err(e) => Err(e),
        }
    }

    async fn build_sessions(
        &self,
        addr: &str,
        update_devices: Option<&[DeviceId]>,
    ) -> Result<(), DispatchError> {
        match update_devices {
            None => {
                let response = self
                    .transport
                    .get_keys_for_addr(addr, None)
                    .await
                    .map_err(DispatchError::from)?;
                let identity = &response.identity_key;
                let tasks = response.devices.iter().map(|bundle| {
                    let address = ProtocolAddress::new(addr, bundle.device_id);
                    async move {
                        process_pre_key(self.store.as_ref(), &address, bundle, identity).await
                    }
                });
                for result in future::join_all(tasks).await {
                    result?;
                }
                Ok(())
            }
            Some(device_ids) => {
                // The underlying fetch must stay strictly sequential
                // for explicit device sets.
                for &device_id in device_ids {
                    match self.transport.get_keys_for_addr(addr, Some(device_id)).await {
                        Ok(response) => {
                            for bundle in &response.devices {
                                let address = ProtocolAddress::new(addr, bundle.device_id);
                                process_pre_key(
                                    self.store.as_ref(),
                                    &address,
                                    bundle,
                                    &response.identity_key,
                                )
                                .await?;
                            }
                        }
                        Err(TransportError::Protocol(p))
                            if p.code == 404 && device_id != PRIMARY_DEVICE_ID =>
                        {
                            debug!(
                                target: "Dispatch/Keys",
                                "device {addr}.{device_id} is gone, dropping its session"
                            );
                            self.remove_device_ids_for_addr(addr, &[device_id]).await?;
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                Ok(())
            }
        }
    }

    async fn reload_devices_and_send(
        &self,
        addr: &str,
        recurse: bool,
    ) -> Result<(), DispatchError> {
        // Re-read the list; reconciliation may have changed it since
        // dispatch entry.
        let device_ids = self.store.get_device_ids(addr).await?;
        self.do_send_message(addr, device_ids, recurse).await
    }

    async fn do_send_message(
        &self,
        addr: &str,
        mut device_ids: Vec<DeviceId>,
        mut recurse: bool,
    ) -> Result<(), DispatchError> {
        let padded = MessageUtils::pad_message(&self.content);
        loop {
            // Ciphers are retained per round, keyed by device id; a 410
            // closes stale sessions through them.
            let ciphers: HashMap<DeviceId, SessionCipher> = device_ids
                .iter()
                .map(|&device_id| {
                    (
                        device_id,
                        SessionCipher::new(
                            self.store.clone(),
                            ProtocolAddress::new(addr, device_id),
                        ),
                    )
                })
                .collect();

            let tasks = ciphers.iter().map(|(&device_id, cipher)| {
                let padded = &padded;
                async move {
                    cipher
                        .encrypt(padded)
                        .await
                        .map(|payload| EncryptedDeviceMessage {
                            msg_type: payload.msg_type,
                            destination_device_id: device_id,
                            destination_registration_id: payload.registration_id,
                            content: payload.body,
                        })
                }
            });
            let mut messages = Vec::with_capacity(ciphers.len());
            for result in future::join_all(tasks).await {
                match result {
                    Ok(message) => messages.push(message),
                    Err(e) => {
                        self.register_error(addr, "Failed to create message".to_string(), e.into())
                            .await;
                        return Ok(());
                    }
                }
            }
            messages.sort_by_key(|m| m.destination_device_id);

            let error = match self
                .transport
                .send_messages(addr, &messages, self.timestamp)
                .await
            {
                Ok(()) => {
                    self.register_sent(addr).await;
                    return Ok(());
                }
                Err(TransportError::Protocol(p)) => p,
                Err(network @ TransportError::Network(_)) => return Err(network.into()),
            };

            match error.code {
                409 | 410 => {
                    if !recurse {
                        self.register_error(
                            addr,
                            format!(
                                "Hit retry limit attempting to reload the device list for address {addr}"
                            ),
                            DispatchError::Protocol(error),
                        )
                        .await;
                        return Ok(());
                    }

                    let code = error.code;
                    let reset_devices = if code == 409 {
                        let Some(mismatch) = error.mismatched_devices() else {
                            return Err(DispatchError::SendRejected {
                                addr: addr.to_string(),
                                source: error,
                            });
                        };
                        debug!(
                            target: "Dispatch/Send",
                            "device list for {addr} out of date: extra {:?}, missing {:?}",
                            mismatch.extra_devices, mismatch.missing_devices
                        );
                        self.remove_device_ids_for_addr(addr, &mismatch.extra_devices)
                            .await?;
                        mismatch.missing_devices
                    } else {
                        let Some(stale) = error.stale_devices() else {
                            return Err(DispatchError::SendRejected {
                                addr: addr.to_string(),
                                source: error,
                            });
                        };
                        debug!(
                            target: "Dispatch/Send",
                            "stale sessions for {addr}: {:?}", stale.stale_devices
                        );
                        for device_id in &stale.stale_devices {
                            match ciphers.get(device_id) {
                                Some(cipher) => cipher.close_open_session().await?,
                                None => warn!(
                                    target: "Dispatch/Send",
                                    "server reported {addr}.{device_id} stale but we never sent to it"
                                ),
                            }
                        }
                        stale.stale_devices
                    };

                    if let Err(e) = self.get_keys_inner(addr, Some(&reset_devices), false).await {
                        self.register_error(
                            addr,
                            format!("Failed to reload device keys for address {addr}"),
                            e,
                        )
                        .await;
                        return Ok(());
                    }

                    device_ids = self.store.get_device_ids(addr).await?;
                    // A 409 reflects the server's authoritative device
                    // set and may converge over further rounds; a 410
                    // gets exactly one recovery transmit.
                    recurse = code == 409;
                }
                404 => {
                    return Err(DispatchError::UnregisteredUser {
                        addr: addr.to_string(),
                        source: error,
                    });
                }
                _ => {
                    return Err(DispatchError::SendRejected {
                        addr: addr.to_string(),
                        source: error,
                    });
                }
            }
        }
    }

    async fn register_sent(&self, addr: &str) {
        let entry = Arc::new(SentEntry {
            addr: addr.to_string(),
            timestamp: Utc::now().timestamp_millis(),
        });
        self.sent.lock().await.push(entry.clone());
        self.events.dispatch(&DispatchEvent::Sent(entry)).await;
    }

    async fn register_error(&self, addr: &str, reason: String, error: DispatchError) {
        warn!(target: "Dispatch/Send", "{reason}: {error}");
        let entry = Arc::new(ErrorEntry {
            addr: addr.to_string(),
            reason,
            timestamp: Utc::now().timestamp_millis(),
            error,
        });
        self.errors.lock().await.push(entry.clone());
        self.events.dispatch(&DispatchEvent::Error(entry)).await;
    }
}
