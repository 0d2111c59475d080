//! End-to-end dispatch scenarios against the scripted mock transport
//! and the in-memory store: happy path, 409/410 reconciliation, retry
//! bounds, identity-key rotation prompts, and unregistered users.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::Mutex;

use relay_core::send::OutgoingMessage;
use relay_core::signal::{IdentityKey, KeyPair, CIPHERTEXT_MESSAGE_TYPE, PREKEY_MESSAGE_TYPE};
use relay_core::store::memory::MemoryStore;
use relay_core::store::traits::{IdentityStore, SessionStore};
use relay_core::test_utils::{
    pre_key_response, seed_open_session, seed_stale_session, KeyOutcome, MockSignalTransport,
    SendOutcome,
};
use relay_core::types::address::ProtocolAddress;
use relay_core::types::events::{DispatchEvent, ErrorEntry, IdentityKeyChange, SentEntry};
use relay_core::DispatchError;

const TIMESTAMP: u64 = 1_722_000_000_123;

struct Harness {
    transport: Arc<MockSignalTransport>,
    store: Arc<MemoryStore>,
    message: OutgoingMessage,
    events: Arc<Mutex<Vec<DispatchEvent>>>,
}

async fn harness() -> Harness {
    let transport = Arc::new(MockSignalTransport::new());
    let store = Arc::new(MemoryStore::new());
    let message = OutgoingMessage::new(
        transport.clone(),
        store.clone(),
        TIMESTAMP,
        b"serialized content plaintext".to_vec(),
    );
    let events: Arc<Mutex<Vec<DispatchEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    message
        .add_event_handler(Arc::new(move |event| {
            let sink = sink.clone();
            Box::pin(async move {
                sink.lock().await.push(event);
                Ok(())
            })
        }))
        .await;
    Harness {
        transport,
        store,
        message,
        events,
    }
}

fn peer_identity() -> IdentityKey {
    IdentityKey(KeyPair::generate().public_key)
}

fn sent_events(events: &[DispatchEvent]) -> Vec<Arc<SentEntry>> {
    events
        .iter()
        .filter_map(|e| match e {
            DispatchEvent::Sent(entry) => Some(entry.clone()),
            _ => None,
        })
        .collect()
}

fn error_events(events: &[DispatchEvent]) -> Vec<Arc<ErrorEntry>> {
    events
        .iter()
        .filter_map(|e| match e {
            DispatchEvent::Error(entry) => Some(entry.clone()),
            _ => None,
        })
        .collect()
}

fn keychange_events(events: &[DispatchEvent]) -> Vec<Arc<IdentityKeyChange>> {
    events
        .iter()
        .filter_map(|e| match e {
            DispatchEvent::KeyChange(change) => Some(change.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_happy_path_two_open_sessions() {
    let h = harness().await;
    let identity = peer_identity();
    seed_open_session(&h.store, "alice", 1, identity).await;
    seed_open_session(&h.store, "alice", 2, identity).await;

    h.message.send_to_addr("alice").await;

    let events = h.events.lock().await;
    let sent = sent_events(&events);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].addr, "alice");
    assert!(error_events(&events).is_empty());

    let sends = h.transport.recorded_sends().await;
    assert_eq!(sends.len(), 1);
    assert_eq!(sends[0].addr, "alice");
    assert_eq!(sends[0].timestamp, TIMESTAMP);
    let devices: Vec<u32> = sends[0]
        .messages
        .iter()
        .map(|m| m.destination_device_id)
        .collect();
    assert_eq!(devices, vec![1, 2]);
    for message in &sends[0].messages {
        assert_eq!(message.msg_type, CIPHERTEXT_MESSAGE_TYPE);
        assert_eq!(
            message.destination_registration_id,
            1000 + message.destination_device_id
        );
    }

    // No key exchange was needed, only the ratchets advanced.
    assert!(h.transport.recorded_key_fetches().await.is_empty());
    let record = h
        .store
        .get_session(&ProtocolAddress::new("alice", 1))
        .await
        .expect("get")
        .expect("record");
    assert_eq!(record.open_state().expect("open").counter, 1);
}

#[tokio::test]
async fn test_409_prunes_extra_device_and_resends() {
    let h = harness().await;
    let identity = peer_identity();
    for device_id in [1, 2, 3] {
        seed_open_session(&h.store, "alice", device_id, identity).await;
    }
    h.transport
        .push_send(SendOutcome::Status(
            409,
            json!({"extraDevices": [3], "missingDevices": []}),
        ))
        .await;

    h.message.send_to_addr("alice").await;

    // The extra device's session was dropped before the retry.
    assert!(h
        .store
        .get_session(&ProtocolAddress::new("alice", 3))
        .await
        .expect("get")
        .is_none());
    // Nothing was missing, so no key fetches happened.
    assert!(h.transport.recorded_key_fetches().await.is_empty());

    let sends = h.transport.recorded_sends().await;
    assert_eq!(sends.len(), 2);
    let retry_devices: Vec<u32> = sends[1]
        .messages
        .iter()
        .map(|m| m.destination_device_id)
        .collect();
    assert_eq!(retry_devices, vec![1, 2]);
    // The dedup timestamp is bit-exact across retries.
    assert!(sends.iter().all(|s| s.timestamp == TIMESTAMP));

    let events = h.events.lock().await;
    assert_eq!(sent_events(&events).len(), 1);
    assert!(error_events(&events).is_empty());
}

#[tokio::test]
async fn test_410_closes_stale_session_and_resends() {
    let h = harness().await;
    let identity = peer_identity();
    h.store
        .put_identity("alice", identity)
        .await
        .expect("put identity");
    seed_open_session(&h.store, "alice", 1, identity).await;
    seed_open_session(&h.store, "alice", 2, identity).await;
    h.transport
        .push_send(SendOutcome::Status(410, json!({"staleDevices": [2]})))
        .await;
    h.transport
        .expect_device_keys(
            "alice",
            2,
            KeyOutcome::Response(pre_key_response(identity, &[2])),
        )
        .await;

    h.message.send_to_addr("alice").await;

    assert_eq!(
        h.transport.recorded_key_fetches().await,
        vec![("alice".to_string(), Some(2))]
    );
    let sends = h.transport.recorded_sends().await;
    assert_eq!(sends.len(), 2);
    // Device 2's session was closed and rebuilt from a fresh bundle, so
    // the recovery transmit bootstraps it again.
    let retry_types: Vec<(u32, u32)> = sends[1]
        .messages
        .iter()
        .map(|m| (m.destination_device_id, m.msg_type))
        .collect();
    assert_eq!(
        retry_types,
        vec![(1, CIPHERTEXT_MESSAGE_TYPE), (2, PREKEY_MESSAGE_TYPE)]
    );

    let events = h.events.lock().await;
    assert_eq!(sent_events(&events).len(), 1);
    assert!(error_events(&events).is_empty());
}

#[tokio::test]
async fn test_second_410_hits_retry_limit() {
    let h = harness().await;
    let identity = peer_identity();
    h.store
        .put_identity("alice", identity)
        .await
        .expect("put identity");
    seed_open_session(&h.store, "alice", 1, identity).await;
    seed_open_session(&h.store, "alice", 2, identity).await;
    h.transport
        .push_send(SendOutcome::Status(410, json!({"staleDevices": [2]})))
        .await;
    h.transport
        .push_send(SendOutcome::Status(410, json!({"staleDevices": [2]})))
        .await;
    h.transport
        .expect_device_keys(
            "alice",
            2,
            KeyOutcome::Response(pre_key_response(identity, &[2])),
        )
        .await;

    h.message.send_to_addr("alice").await;

    // The second 410 terminates the dispatch; no third transmit.
    assert_eq!(h.transport.recorded_sends().await.len(), 2);

    let events = h.events.lock().await;
    assert!(sent_events(&events).is_empty());
    let errors = error_events(&events);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].reason.starts_with("Hit retry limit"));
    match &errors[0].error {
        DispatchError::Protocol(protocol) => assert_eq!(protocol.code, 410),
        other => panic!("unexpected cause: {other:?}"),
    }
}

#[tokio::test]
async fn test_identity_change_accepted_retries_and_sends() {
    let h = harness().await;
    let old_identity = peer_identity();
    let new_identity = peer_identity();
    h.store
        .put_identity("alice", old_identity)
        .await
        .expect("put identity");
    seed_stale_session(&h.store, "alice", 1, old_identity).await;
    h.transport
        .expect_device_keys(
            "alice",
            1,
            KeyOutcome::Response(pre_key_response(new_identity, &[1])),
        )
        .await;
    h.message
        .add_event_handler(Arc::new(|event| {
            Box::pin(async move {
                if let DispatchEvent::KeyChange(change) = event {
                    change.accept();
                }
                Ok(())
            })
        }))
        .await;

    h.message.send_to_addr("alice").await;

    let events = h.events.lock().await;
    let changes = keychange_events(&events);
    assert_eq!(changes.len(), 1, "the reentrant retry must not re-prompt");
    assert_eq!(changes[0].addr(), "alice");
    assert_eq!(*changes[0].identity_key(), new_identity);

    assert_eq!(sent_events(&events).len(), 1);
    assert!(error_events(&events).is_empty());
    assert_eq!(
        h.store.get_identity("alice").await.expect("get"),
        Some(new_identity)
    );

    let sends = h.transport.recorded_sends().await;
    assert_eq!(sends.len(), 1);
    assert_eq!(sends[0].messages[0].msg_type, PREKEY_MESSAGE_TYPE);
}

#[tokio::test]
async fn test_identity_change_rejected_terminates_dispatch() {
    let h = harness().await;
    let old_identity = peer_identity();
    let new_identity = peer_identity();
    h.store
        .put_identity("alice", old_identity)
        .await
        .expect("put identity");
    seed_stale_session(&h.store, "alice", 1, old_identity).await;
    h.transport
        .expect_device_keys(
            "alice",
            1,
            KeyOutcome::Response(pre_key_response(new_identity, &[1])),
        )
        .await;

    h.message.send_to_addr("alice").await;

    let events = h.events.lock().await;
    assert_eq!(keychange_events(&events).len(), 1);
    assert!(sent_events(&events).is_empty());
    let errors = error_events(&events);
    assert_eq!(errors.len(), 1);
    assert_eq!(
        errors[0].reason,
        "Failed to retrieve new device keys for address alice"
    );
    assert!(matches!(
        &errors[0].error,
        DispatchError::IdentityChanged(_)
    ));

    // The pinned identity stays untouched and nothing was transmitted.
    assert_eq!(
        h.store.get_identity("alice").await.expect("get"),
        Some(old_identity)
    );
    assert!(h.transport.recorded_sends().await.is_empty());
}

#[tokio::test]
async fn test_404_on_transmit_reports_unregistered_user() {
    let h = harness().await;
    seed_open_session(&h.store, "alice", 1, peer_identity()).await;
    h.transport
        .push_send(SendOutcome::Status(404, serde_json::Value::Null))
        .await;

    h.message.send_to_addr("alice").await;

    // No retries for an unregistered address.
    assert_eq!(h.transport.recorded_sends().await.len(), 1);

    let events = h.events.lock().await;
    assert!(sent_events(&events).is_empty());
    let errors = error_events(&events);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].reason, "Failed to send to address alice");
    assert!(matches!(
        &errors[0].error,
        DispatchError::UnregisteredUser { .. }
    ));
}

#[tokio::test]
async fn test_404_during_key_fetch_prunes_secondary_device() {
    let h = harness().await;
    let identity = peer_identity();
    h.store
        .put_identity("alice", identity)
        .await
        .expect("put identity");
    seed_open_session(&h.store, "alice", 1, identity).await;
    seed_stale_session(&h.store, "alice", 2, identity).await;
    h.transport
        .expect_device_keys("alice", 2, KeyOutcome::Status(404))
        .await;

    h.message.send_to_addr("alice").await;

    // The gone device was dropped silently and the dispatch went on
    // with what was left.
    assert!(h
        .store
        .get_session(&ProtocolAddress::new("alice", 2))
        .await
        .expect("get")
        .is_none());
    let sends = h.transport.recorded_sends().await;
    assert_eq!(sends.len(), 1);
    assert_eq!(sends[0].messages.len(), 1);
    assert_eq!(sends[0].messages[0].destination_device_id, 1);

    let events = h.events.lock().await;
    assert_eq!(sent_events(&events).len(), 1);
    assert!(error_events(&events).is_empty());
}

#[tokio::test]
async fn test_404_during_key_fetch_propagates_for_primary_device() {
    let h = harness().await;
    let identity = peer_identity();
    seed_stale_session(&h.store, "alice", 1, identity).await;
    h.transport
        .expect_device_keys("alice", 1, KeyOutcome::Status(404))
        .await;

    h.message.send_to_addr("alice").await;

    let events = h.events.lock().await;
    assert!(sent_events(&events).is_empty());
    let errors = error_events(&events);
    assert_eq!(errors.len(), 1);
    assert_eq!(
        errors[0].reason,
        "Failed to retrieve new device keys for address alice"
    );
    // The 404 signal is passed through unwrapped.
    match &errors[0].error {
        DispatchError::Protocol(protocol) => assert_eq!(protocol.code, 404),
        other => panic!("unexpected cause: {other:?}"),
    }
    // The primary device's session survives.
    assert!(h
        .store
        .get_session(&ProtocolAddress::new("alice", 1))
        .await
        .expect("get")
        .is_some());
    assert!(h.transport.recorded_sends().await.is_empty());
}

#[tokio::test]
async fn test_empty_device_list_converges_via_409() {
    let h = harness().await;
    let identity = peer_identity();
    h.transport
        .push_send(SendOutcome::Status(
            409,
            json!({"extraDevices": [], "missingDevices": [1, 2]}),
        ))
        .await;
    for device_id in [1, 2] {
        h.transport
            .expect_device_keys(
                "alice",
                device_id,
                KeyOutcome::Response(pre_key_response(identity, &[device_id])),
            )
            .await;
    }

    h.message.send_to_addr("alice").await;

    let sends = h.transport.recorded_sends().await;
    assert_eq!(sends.len(), 2);
    assert!(sends[0].messages.is_empty());
    assert!(sends.iter().all(|s| s.timestamp == TIMESTAMP));
    let retry_types: Vec<(u32, u32)> = sends[1]
        .messages
        .iter()
        .map(|m| (m.destination_device_id, m.msg_type))
        .collect();
    assert_eq!(
        retry_types,
        vec![(1, PREKEY_MESSAGE_TYPE), (2, PREKEY_MESSAGE_TYPE)]
    );

    // Missing devices were fetched strictly in sequence.
    assert_eq!(
        h.transport.recorded_key_fetches().await,
        vec![
            ("alice".to_string(), Some(1)),
            ("alice".to_string(), Some(2))
        ]
    );

    // The local view converged on the server's.
    assert_eq!(
        h.store.get_device_ids("alice").await.expect("ids"),
        vec![1, 2]
    );

    let events = h.events.lock().await;
    assert_eq!(sent_events(&events).len(), 1);
    assert!(error_events(&events).is_empty());
}

#[tokio::test]
async fn test_network_error_propagates_unchanged() {
    let h = harness().await;
    seed_open_session(&h.store, "alice", 1, peer_identity()).await;
    h.transport
        .push_send(SendOutcome::Network("connection reset by peer"))
        .await;

    h.message.send_to_addr("alice").await;

    let events = h.events.lock().await;
    assert!(sent_events(&events).is_empty());
    let errors = error_events(&events);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].reason, "Failed to send to address alice");
    assert!(matches!(&errors[0].error, DispatchError::Network(_)));
}

#[tokio::test]
async fn test_full_key_fetch_builds_all_sessions_in_one_rpc() {
    let h = harness().await;
    let identity = peer_identity();
    h.transport
        .expect_keys("alice", pre_key_response(identity, &[1, 2, 3]))
        .await;

    h.message
        .get_keys_for_addr("alice", None)
        .await
        .expect("fetch");

    assert_eq!(
        h.transport.recorded_key_fetches().await,
        vec![("alice".to_string(), None)]
    );
    assert_eq!(
        h.store.get_device_ids("alice").await.expect("ids"),
        vec![1, 2, 3]
    );
    assert_eq!(
        h.store.get_identity("alice").await.expect("get"),
        Some(identity)
    );
}
