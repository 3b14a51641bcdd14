//! EventBus - Bounded-History Pub/Sub
//!
//! ## Responsibilities
//!
//! - Keep the last N events in a ring buffer for late-joining clients
//! - Fan out events to every live subscriber without blocking the publisher
//! - Drop messages for a full subscriber, prune disconnected ones
//!
//! Publishing never waits: the registry lock is held only for the
//! non-blocking `try_send` fan-out and is never held across an await.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Per-subscriber channel depth. A subscriber that falls this far behind
/// starts losing events (newest dropped for that subscriber only).
const SUBSCRIBER_BUFFER: usize = 32;

/// A broadcast event. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    pub ts: DateTime<Utc>,
    pub data: serde_json::Value,
}

struct Inner {
    history: VecDeque<Event>,
    capacity: usize,
    subscribers: HashMap<Uuid, mpsc::Sender<Event>>,
}

/// EventBus instance
pub struct EventBus {
    inner: RwLock<Inner>,
}

impl EventBus {
    /// Create a new bus with the given history capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(Inner {
                history: VecDeque::with_capacity(capacity),
                capacity: capacity.max(1),
                subscribers: HashMap::new(),
            }),
        }
    }

    /// Publish an event: append to history, fan out to all subscribers.
    ///
    /// Never blocks. A subscriber whose channel is full loses this event;
    /// a subscriber whose receiver is gone is removed.
    pub fn publish(&self, event_type: &str, data: serde_json::Value) -> Event {
        let event = Event {
            event_type: event_type.to_string(),
            ts: Utc::now(),
            data,
        };

        let mut inner = self.inner.write().expect("event bus lock poisoned");
        if inner.history.len() >= inner.capacity {
            inner.history.pop_front();
        }
        inner.history.push_back(event.clone());

        let mut closed = Vec::new();
        for (id, tx) in &inner.subscribers {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::debug!(subscriber_id = %id, event_type = %event.event_type, "Subscriber full, event dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    closed.push(*id);
                }
            }
        }
        for id in closed {
            inner.subscribers.remove(&id);
            tracing::info!(subscriber_id = %id, "Subscriber disconnected");
        }

        event
    }

    /// Register a new subscriber. The handle unregisters itself on drop.
    pub fn subscribe(self: &Arc<Self>) -> EventSubscription {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);

        {
            let mut inner = self.inner.write().expect("event bus lock poisoned");
            inner.subscribers.insert(id, tx);
        }
        tracing::info!(subscriber_id = %id, "Subscriber registered");

        EventSubscription {
            bus: self.clone(),
            id,
            rx,
        }
    }

    /// Last ≤N events in publish order
    pub fn history(&self) -> Vec<Event> {
        let inner = self.inner.read().expect("event bus lock poisoned");
        inner.history.iter().cloned().collect()
    }

    /// Current subscriber count
    pub fn subscriber_count(&self) -> usize {
        let inner = self.inner.read().expect("event bus lock poisoned");
        inner.subscribers.len()
    }

    fn unsubscribe(&self, id: &Uuid) {
        let mut inner = self.inner.write().expect("event bus lock poisoned");
        if inner.subscribers.remove(id).is_some() {
            tracing::info!(subscriber_id = %id, "Subscriber unregistered");
        }
    }
}

/// Live event stream handle for one client
pub struct EventSubscription {
    bus: Arc<EventBus>,
    id: Uuid,
    rx: mpsc::Receiver<Event>,
}

impl EventSubscription {
    /// Receive the next event. `None` only after the bus dropped this
    /// subscriber (which it never does on its own).
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_history_capped_and_ordered() {
        let bus = Arc::new(EventBus::new(100));
        for i in 0..150 {
            bus.publish("tick", json!({ "seq": i }));
        }

        let history = bus.history();
        assert_eq!(history.len(), 100);
        assert_eq!(history[0].data["seq"], 50);
        assert_eq!(history[99].data["seq"], 149);
    }

    #[tokio::test]
    async fn test_fan_out_to_all_subscribers() {
        let bus = Arc::new(EventBus::new(10));
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish("state", json!({ "mode": "idle" }));

        let ea = a.recv().await.unwrap();
        let eb = b.recv().await.unwrap();
        assert_eq!(ea.event_type, "state");
        assert_eq!(eb.data["mode"], "idle");
    }

    #[tokio::test]
    async fn test_full_subscriber_drops_without_blocking() {
        let bus = Arc::new(EventBus::new(200));
        let mut slow = bus.subscribe();

        // Overfill the slow subscriber's channel; publish must not block.
        for i in 0..SUBSCRIBER_BUFFER + 10 {
            bus.publish("tick", json!({ "seq": i }));
        }

        // Still registered, just lossy.
        assert_eq!(bus.subscriber_count(), 1);
        let first = slow.recv().await.unwrap();
        assert_eq!(first.data["seq"], 0);
    }

    #[tokio::test]
    async fn test_dropped_subscriber_pruned_on_publish() {
        let bus = Arc::new(EventBus::new(10));
        let sub = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);

        // Publishing after the drop must not fail.
        bus.publish("tick", json!({}));
    }

    #[tokio::test]
    async fn test_publish_order_preserved_per_subscriber() {
        let bus = Arc::new(EventBus::new(10));
        let mut sub = bus.subscribe();

        bus.publish("a", json!({}));
        bus.publish("b", json!({}));
        bus.publish("c", json!({}));

        assert_eq!(sub.recv().await.unwrap().event_type, "a");
        assert_eq!(sub.recv().await.unwrap().event_type, "b");
        assert_eq!(sub.recv().await.unwrap().event_type, "c");
    }
}
