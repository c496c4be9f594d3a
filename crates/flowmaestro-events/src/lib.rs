//! # Event Fan-out
//!
//! Delivers engine lifecycle events to live subscribers (WebSocket clients)
//! with user-scoped filtering. Delivery is best-effort and at-most-once:
//! each subscriber gets a bounded queue, a full queue drops the newest event
//! for that subscriber rather than back-pressuring the engine, and drops are
//! counted where operators can see them.
//!
//! The same crate carries the small in-process topic bus that event triggers
//! subscribe to.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use flowmaestro_durable::{EngineEvent, EngineObserver};

/// Default per-subscriber queue depth.
const DEFAULT_QUEUE_DEPTH: usize = 256;

/// One subscriber's end of the fan-out.
pub struct Subscription {
    pub id: Uuid,
    pub receiver: mpsc::Receiver<EngineEvent>,
    hub: Arc<HubInner>,
}

impl Subscription {
    /// Events dropped for this subscriber so far.
    pub fn dropped(&self) -> u64 {
        self.hub
            .subscribers
            .get(&self.id)
            .map(|s| s.dropped.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.subscribers.remove(&self.id);
    }
}

struct Subscriber {
    user_id: Uuid,
    admin: bool,
    sender: mpsc::Sender<EngineEvent>,
    dropped: AtomicU64,
}

struct HubInner {
    subscribers: DashMap<Uuid, Subscriber>,
    total_dropped: AtomicU64,
    queue_depth: usize,
}

/// The fan-out hub. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct FanoutHub {
    inner: Arc<HubInner>,
}

impl FanoutHub {
    pub fn new() -> Self {
        Self::with_queue_depth(DEFAULT_QUEUE_DEPTH)
    }

    pub fn with_queue_depth(queue_depth: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                subscribers: DashMap::new(),
                total_dropped: AtomicU64::new(0),
                queue_depth,
            }),
        }
    }

    /// Register a subscriber. Admins receive every event; everyone else only
    /// sees events for executions they own.
    pub fn subscribe(&self, user_id: Uuid, admin: bool) -> Subscription {
        let id = Uuid::now_v7();
        let (sender, receiver) = mpsc::channel(self.inner.queue_depth);
        self.inner.subscribers.insert(
            id,
            Subscriber {
                user_id,
                admin,
                sender,
                dropped: AtomicU64::new(0),
            },
        );
        Subscription {
            id,
            receiver,
            hub: self.inner.clone(),
        }
    }

    /// Deliver one event to every matching subscriber. Never blocks: a full
    /// queue drops the event for that subscriber and bumps the counters.
    pub fn publish(&self, event: EngineEvent) {
        for entry in self.inner.subscribers.iter() {
            let subscriber = entry.value();
            if !subscriber.admin && subscriber.user_id != event.user_id {
                continue;
            }
            if subscriber.sender.try_send(event.clone()).is_err() {
                subscriber.dropped.fetch_add(1, Ordering::Relaxed);
                self.inner.total_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    subscriber = %entry.key(),
                    event = %event.name,
                    "dropped event for slow subscriber"
                );
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    /// Total events dropped across all subscribers since startup.
    pub fn total_dropped(&self) -> u64 {
        self.inner.total_dropped.load(Ordering::Relaxed)
    }
}

impl Default for FanoutHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineObserver for FanoutHub {
    fn publish(&self, event: EngineEvent) {
        FanoutHub::publish(self, event);
    }
}

// =============================================================================
// Topic bus for event triggers
// =============================================================================

/// A published application event that triggers can match on.
#[derive(Debug, Clone)]
pub struct TopicEvent {
    pub topic: String,
    pub payload: Value,
}

/// In-process topic bus: named topics, broadcast semantics. Event triggers
/// subscribe to a topic and filter on payload fields.
#[derive(Clone, Default)]
pub struct EventBus {
    topics: Arc<DashMap<String, broadcast::Sender<TopicEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<TopicEvent> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(64).0)
            .subscribe()
    }

    /// Publish to a topic. Returns how many subscribers saw the event.
    pub fn publish(&self, topic: &str, payload: Value) -> usize {
        match self.topics.get(topic) {
            Some(sender) => sender
                .send(TopicEvent {
                    topic: topic.to_string(),
                    payload,
                })
                .unwrap_or(0),
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(user_id: Uuid, name: &str) -> EngineEvent {
        EngineEvent::new(Uuid::now_v7(), user_id, name, json!({}))
    }

    #[tokio::test]
    async fn test_user_scoped_delivery() {
        let hub = FanoutHub::new();
        let alice = Uuid::now_v7();
        let bob = Uuid::now_v7();

        let mut alice_sub = hub.subscribe(alice, false);
        let mut bob_sub = hub.subscribe(bob, false);

        hub.publish(event(alice, "execution.started"));

        let got = alice_sub.receiver.recv().await.unwrap();
        assert_eq!(got.name, "execution.started");
        assert!(bob_sub.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_admin_sees_everything() {
        let hub = FanoutHub::new();
        let admin = Uuid::now_v7();
        let user = Uuid::now_v7();

        let mut admin_sub = hub.subscribe(admin, true);
        hub.publish(event(user, "node.completed"));

        let got = admin_sub.receiver.recv().await.unwrap();
        assert_eq!(got.name, "node.completed");
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_without_blocking() {
        let hub = FanoutHub::with_queue_depth(2);
        let user = Uuid::now_v7();
        let sub = hub.subscribe(user, false);

        for _ in 0..5 {
            hub.publish(event(user, "log.appended"));
        }

        // Queue holds 2; the other 3 were dropped and counted.
        assert_eq!(sub.dropped(), 3);
        assert_eq!(hub.total_dropped(), 3);
    }

    #[tokio::test]
    async fn test_unsubscribe_on_drop() {
        let hub = FanoutHub::new();
        let sub = hub.subscribe(Uuid::now_v7(), false);
        assert_eq!(hub.subscriber_count(), 1);
        drop(sub);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_event_bus_topics_are_independent() {
        let bus = EventBus::new();
        let mut orders = bus.subscribe("orders");
        let mut users = bus.subscribe("users");

        assert_eq!(bus.publish("orders", json!({"id": 1})), 1);

        let got = orders.recv().await.unwrap();
        assert_eq!(got.payload["id"], 1);
        assert!(users.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.publish("nobody", json!({})), 0);
    }
}
