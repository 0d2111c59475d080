use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use log::warn;
use tokio::sync::RwLock;

use crate::error::DispatchError;
use crate::signal::IdentityKey;

/// Everything a dispatch reports to its observers. Handlers receive the
/// event by value; large entries sit behind an `Arc` so cloning per
/// handler stays cheap.
#[derive(Debug, Clone)]
pub enum DispatchEvent {
    Sent(Arc<SentEntry>),
    Error(Arc<ErrorEntry>),
    KeyChange(Arc<IdentityKeyChange>),
}

/// One acknowledged recipient. `timestamp` is the observation time in
/// epoch milliseconds, not the dispatch timestamp.
#[derive(Debug)]
pub struct SentEntry {
    pub addr: String,
    pub timestamp: i64,
}

/// One terminal failure for a recipient. The metadata is fixed at
/// construction; the cause is never mutated after the fact.
#[derive(Debug)]
pub struct ErrorEntry {
    pub addr: String,
    pub reason: String,
    pub timestamp: i64,
    pub error: DispatchError,
}

/// Payload of a `KeyChange` event. A handler confirms the new identity
/// by calling [`accept`](Self::accept); the dispatch reads the flag back
/// once all handlers have run.
#[derive(Debug)]
pub struct IdentityKeyChange {
    addr: String,
    identity_key: IdentityKey,
    accepted: AtomicBool,
}

impl IdentityKeyChange {
    pub fn new(addr: impl Into<String>, identity_key: IdentityKey) -> Self {
        Self {
            addr: addr.into(),
            identity_key,
            accepted: AtomicBool::new(false),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn identity_key(&self) -> &IdentityKey {
        &self.identity_key
    }

    pub fn accept(&self) {
        self.accepted.store(true, Ordering::SeqCst);
    }

    pub fn is_accepted(&self) -> bool {
        self.accepted.load(Ordering::SeqCst)
    }
}

pub type EventHandler =
    Arc<dyn Fn(DispatchEvent) -> BoxFuture<'static, Result<(), anyhow::Error>> + Send + Sync>;

static NEXT_HANDLER_ID: AtomicUsize = AtomicUsize::new(1);

struct WrappedHandler {
    id: usize,
    handler: EventHandler,
}

/// Ordered async observer list. Handlers run sequentially in
/// registration order; a failing handler is logged and does not stop
/// the ones after it.
#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<Vec<WrappedHandler>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_handler(&self, handler: EventHandler) -> usize {
        let id = NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .write()
            .await
            .push(WrappedHandler { id, handler });
        id
    }

    pub async fn remove_handler(&self, id: usize) -> bool {
        let mut handlers = self.handlers.write().await;
        let initial_len = handlers.len();
        handlers.retain(|h| h.id != id);
        handlers.len() < initial_len
    }

    pub async fn dispatch(&self, event: &DispatchEvent) {
        let handlers = self.handlers.read().await;
        for wrapped in handlers.iter() {
            if let Err(e) = (wrapped.handler)(event.clone()).await {
                warn!(target: "Dispatch/Events", "event handler failed: {e:#}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;

    fn recording_handler(log: Arc<Mutex<Vec<&'static str>>>, tag: &'static str) -> EventHandler {
        Arc::new(move |_event| {
            let log = log.clone();
            Box::pin(async move {
                log.lock().await.push(tag);
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn test_handlers_run_in_registration_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.add_handler(recording_handler(log.clone(), "first")).await;
        bus.add_handler(recording_handler(log.clone(), "second")).await;

        let entry = Arc::new(SentEntry {
            addr: "alice".into(),
            timestamp: 0,
        });
        bus.dispatch(&DispatchEvent::Sent(entry)).await;

        assert_eq!(*log.lock().await, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_stop_later_ones() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.add_handler(Arc::new(|_event| {
            Box::pin(async { Err(anyhow::anyhow!("handler exploded")) })
        }))
        .await;
        bus.add_handler(recording_handler(log.clone(), "survivor")).await;

        let entry = Arc::new(SentEntry {
            addr: "alice".into(),
            timestamp: 0,
        });
        bus.dispatch(&DispatchEvent::Sent(entry)).await;

        assert_eq!(*log.lock().await, vec!["survivor"]);
    }

    #[tokio::test]
    async fn test_remove_handler() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let id = bus
            .add_handler(recording_handler(log.clone(), "removed"))
            .await;
        assert!(bus.remove_handler(id).await);
        assert!(!bus.remove_handler(id).await);

        let entry = Arc::new(SentEntry {
            addr: "alice".into(),
            timestamp: 0,
        });
        bus.dispatch(&DispatchEvent::Sent(entry)).await;
        assert!(log.lock().await.is_empty());
    }
}
