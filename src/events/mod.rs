//! In-process publish/subscribe dispatcher.
//!
//! The bus is the delivery fabric between gateway adapters, the orchestrator
//! and external subscribers. Publishing never blocks the caller: events are
//! queued on an unbounded channel and delivered by a single dispatcher task.
//! A panicking handler is caught and logged so delivery continues to the
//! remaining handlers and the bus itself never dies.

use dashmap::DashMap;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{GatewayError, Result};
use crate::utils::now_millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Connect,
    Disconnect,
    Order,
    Trade,
    Position,
    Account,
    Error,
    Heartbeat,
    Alert,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Connect => "connect",
            EventKind::Disconnect => "disconnect",
            EventKind::Order => "order",
            EventKind::Trade => "trade",
            EventKind::Position => "position",
            EventKind::Account => "account",
            EventKind::Error => "error",
            EventKind::Heartbeat => "heartbeat",
            EventKind::Alert => "alert",
        }
    }
}

/// In-process event envelope. Never serialized externally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub gateway: String,
    pub payload: serde_json::Value,
    pub timestamp_ms: u64,
}

impl Event {
    pub fn new(kind: EventKind, gateway: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind,
            gateway: gateway.into(),
            payload,
            timestamp_ms: now_millis(),
        }
    }
}

pub type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Publish/subscribe dispatcher with explicit Stopped/Running states.
///
/// `start()`/`stop()` are idempotent. Handlers are keyed by `(kind, id)` so
/// repeated subscription with the same id replaces rather than duplicates.
pub struct EventBus {
    handlers: Arc<DashMap<EventKind, Vec<(String, EventHandler)>>>,
    sender: RwLock<Option<mpsc::UnboundedSender<Event>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    stop_timeout: Duration,
}

impl EventBus {
    pub fn new(stop_timeout: Duration) -> Self {
        Self {
            handlers: Arc::new(DashMap::new()),
            sender: RwLock::new(None),
            dispatcher: Mutex::new(None),
            stop_timeout,
        }
    }

    pub fn is_running(&self) -> bool {
        self.sender.read().expect("bus sender lock poisoned").is_some()
    }

    /// Start the dispatcher task. No-op when already running.
    pub fn start(&self) {
        let mut sender = self.sender.write().expect("bus sender lock poisoned");
        if sender.is_some() {
            debug!("Event bus already running");
            return;
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        let handlers = Arc::clone(&self.handlers);

        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                // Snapshot the handler list so subscribe/unsubscribe during
                // dispatch cannot affect this delivery.
                let snapshot: Vec<(String, EventHandler)> = handlers
                    .get(&event.kind)
                    .map(|entry| entry.value().clone())
                    .unwrap_or_default();

                for (id, handler) in snapshot {
                    let outcome = catch_unwind(AssertUnwindSafe(|| handler(&event)));
                    if outcome.is_err() {
                        let err = GatewayError::HandlerError(format!(
                            "handler '{}' panicked on {} event",
                            id,
                            event.kind.as_str()
                        ));
                        error!("{}", err);
                    }
                }
            }
            debug!("Event bus dispatcher drained and exited");
        });

        *sender = Some(tx);
        *self.dispatcher.lock().expect("bus dispatcher lock poisoned") = Some(handle);
        info!("🚀 Event bus started");
    }

    /// Stop the bus: reject further publishes, drain queued events for up to
    /// the stop timeout, then force termination. No-op when already stopped.
    pub async fn stop(&self) {
        // Dropping the sender closes the channel; the dispatcher exits once
        // the backlog is drained.
        let had_sender = self
            .sender
            .write()
            .expect("bus sender lock poisoned")
            .take()
            .is_some();

        let handle = self
            .dispatcher
            .lock()
            .expect("bus dispatcher lock poisoned")
            .take();

        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            match tokio::time::timeout(self.stop_timeout, handle).await {
                Ok(_) => info!("🛑 Event bus stopped"),
                Err(_) => {
                    abort.abort();
                    warn!(
                        "⚠️ Event bus dispatcher did not drain within {:?}, aborting",
                        self.stop_timeout
                    );
                }
            }
        } else if had_sender {
            info!("🛑 Event bus stopped");
        } else {
            debug!("Event bus already stopped");
        }
    }

    /// Publish an event. Returns `BusStopped` while the bus is not running -
    /// events are never silently dropped.
    pub fn publish(&self, event: Event) -> Result<()> {
        let sender = self.sender.read().expect("bus sender lock poisoned");
        match sender.as_ref() {
            Some(tx) => tx.send(event).map_err(|_| GatewayError::BusStopped),
            None => Err(GatewayError::BusStopped),
        }
    }

    /// Register a handler under `(kind, id)`. Subscribing the same id again
    /// replaces the previous handler instead of duplicating delivery.
    pub fn subscribe(&self, kind: EventKind, id: impl Into<String>, handler: EventHandler) {
        let id = id.into();
        let mut entry = self.handlers.entry(kind).or_insert_with(Vec::new);
        if let Some(slot) = entry.iter_mut().find(|(existing, _)| *existing == id) {
            slot.1 = handler;
        } else {
            entry.push((id, handler));
        }
    }

    /// Remove the handler registered under `(kind, id)`. No-op when absent.
    pub fn unsubscribe(&self, kind: EventKind, id: &str) {
        if let Some(mut entry) = self.handlers.get_mut(&kind) {
            entry.retain(|(existing, _)| existing.as_str() != id);
        }
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.get(&kind).map(|e| e.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn bus() -> EventBus {
        EventBus::new(Duration::from_millis(500))
    }

    fn counting_handler(counter: Arc<AtomicUsize>) -> EventHandler {
        Arc::new(move |_event: &Event| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn test_publish_while_stopped_is_rejected() {
        let bus = bus();
        let event = Event::new(EventKind::Connect, "gw-a", serde_json::json!({}));
        assert!(matches!(bus.publish(event), Err(GatewayError::BusStopped)));
    }

    #[tokio::test]
    async fn test_every_handler_invoked_exactly_once_despite_panic() {
        let bus = bus();
        let before = Arc::new(AtomicUsize::new(0));
        let after = Arc::new(AtomicUsize::new(0));

        bus.subscribe(EventKind::Order, "before", counting_handler(Arc::clone(&before)));
        bus.subscribe(
            EventKind::Order,
            "bomb",
            Arc::new(|_event: &Event| panic!("subscriber bug")),
        );
        bus.subscribe(EventKind::Order, "after", counting_handler(Arc::clone(&after)));

        bus.start();
        bus.publish(Event::new(EventKind::Order, "gw-a", serde_json::json!({"id": 1})))
            .unwrap();
        bus.stop().await;

        assert_eq!(before.load(Ordering::SeqCst), 1);
        assert_eq!(after.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_drains_backlog() {
        let bus = bus();
        let seen = Arc::new(AtomicUsize::new(0));
        bus.subscribe(EventKind::Trade, "count", counting_handler(Arc::clone(&seen)));

        bus.start();
        for i in 0..50 {
            bus.publish(Event::new(EventKind::Trade, "gw-a", serde_json::json!({ "seq": i })))
                .unwrap();
        }
        bus.stop().await;

        assert_eq!(seen.load(Ordering::SeqCst), 50);
        // Post-stop publish is rejected again.
        assert!(bus
            .publish(Event::new(EventKind::Trade, "gw-a", serde_json::json!({})))
            .is_err());
    }

    #[tokio::test]
    async fn test_subscribe_is_idempotent_per_id() {
        let bus = bus();
        let seen = Arc::new(AtomicUsize::new(0));
        bus.subscribe(EventKind::Account, "h", counting_handler(Arc::clone(&seen)));
        bus.subscribe(EventKind::Account, "h", counting_handler(Arc::clone(&seen)));
        assert_eq!(bus.handler_count(EventKind::Account), 1);

        bus.start();
        bus.publish(Event::new(EventKind::Account, "gw-a", serde_json::json!({})))
            .unwrap();
        bus.stop().await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let bus = bus();
        bus.subscribe(EventKind::Error, "h", Arc::new(|_| {}));
        bus.unsubscribe(EventKind::Error, "h");
        bus.unsubscribe(EventKind::Error, "h");
        assert_eq!(bus.handler_count(EventKind::Error), 0);
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let bus = bus();
        bus.start();
        bus.start();
        assert!(bus.is_running());
        bus.stop().await;
        bus.stop().await;
        assert!(!bus.is_running());
        // Restart works after a full stop.
        bus.start();
        assert!(bus.is_running());
        bus.stop().await;
    }
}
