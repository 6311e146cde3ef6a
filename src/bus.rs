// =============================================================================
// Event Bus (C4) — bounded per-subscriber queues, drop-oldest on overflow
// =============================================================================
//
// New: the teacher has no pub/sub primitive, and barter-integration's
// `channel.rs` `Tx` trait (a droppable sender that disables itself on send
// failure) is unbounded and has no drop-oldest semantics, so it's not
// reusable here. Built in the teacher's lock-plus-atomic-counter idiom
// (the `state_version: AtomicU64` pattern from `app_state.rs`) instead.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::Notify;
use tracing::trace;

/// A single delivered event: the topic it was published on (subscribers may
/// share a queue across several topics they subscribed to) and its payload.
#[derive(Debug, Clone)]
pub struct BusEvent {
    pub topic: String,
    pub payload: Value,
}

struct Subscriber {
    queue: Mutex<VecDeque<BusEvent>>,
    notify: Notify,
    overflow: AtomicU64,
    capacity: usize,
}

impl Subscriber {
    fn push(&self, event: BusEvent) {
        let mut queue = self.queue.lock();
        if queue.len() >= self.capacity {
            queue.pop_front();
            self.overflow.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(event);
        drop(queue);
        self.notify.notify_one();
    }
}

/// Handle returned by [`EventBus::subscribe`]. Dropping it (or calling
/// [`Subscription::unsubscribe`]) removes the subscriber from the bus
/// synchronously: no event delivered after that call returns.
pub struct Subscription {
    id: u64,
    topic: String,
    subscriber: Arc<Subscriber>,
    bus: Arc<EventBusInner>,
}

impl Subscription {
    /// Wait for the next event in FIFO order. Cancel-safe: if the future is
    /// dropped before an event arrives, no event is lost from the queue.
    pub async fn recv(&self) -> BusEvent {
        loop {
            if let Some(event) = self.subscriber.queue.lock().pop_front() {
                return event;
            }
            self.subscriber.notify.notified().await;
        }
    }

    pub fn overflow_count(&self) -> u64 {
        self.subscriber.overflow.load(Ordering::Relaxed)
    }

    pub fn unsubscribe(self) {
        // Drop impl does the work; this just gives callers an explicit name.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.remove(&self.topic, self.id);
    }
}

#[derive(Default)]
struct EventBusInner {
    topics: RwLock<HashMap<String, Vec<(u64, Arc<Subscriber>)>>>,
    next_id: AtomicU64,
}

impl EventBusInner {
    fn remove(&self, topic: &str, id: u64) {
        let mut topics = self.topics.write();
        if let Some(subs) = topics.get_mut(topic) {
            subs.retain(|(sub_id, _)| *sub_id != id);
            if subs.is_empty() {
                topics.remove(topic);
            }
        }
    }
}

const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

/// The process-wide publish/subscribe bus for `leaderboard:update`,
/// `leaderboard:error`, `klines:update:{symbol}:{interval}`, and
/// `prices:update`. Publish never blocks: it takes a read lock over the
/// topic map, then pushes into each matching subscriber's own queue.
pub struct EventBus {
    inner: Arc<EventBusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EventBusInner::default()),
        }
    }

    pub fn subscribe(&self, topic: impl Into<String>) -> Subscription {
        self.subscribe_with_capacity(topic, DEFAULT_SUBSCRIBER_CAPACITY)
    }

    pub fn subscribe_with_capacity(&self, topic: impl Into<String>, capacity: usize) -> Subscription {
        let topic = topic.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let subscriber = Arc::new(Subscriber {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            notify: Notify::new(),
            overflow: AtomicU64::new(0),
            capacity,
        });

        self.inner
            .topics
            .write()
            .entry(topic.clone())
            .or_default()
            .push((id, subscriber.clone()));

        Subscription {
            id,
            topic,
            subscriber,
            bus: self.inner.clone(),
        }
    }

    /// Non-blocking publish. Unknown topics (no subscribers) are a no-op.
    pub fn publish(&self, topic: &str, payload: Value) {
        let topics = self.inner.topics.read();
        let Some(subs) = topics.get(topic) else {
            return;
        };
        let event = BusEvent {
            topic: topic.to_string(),
            payload,
        };
        for (_, sub) in subs {
            sub.push(event.clone());
        }
        trace!(topic, subscribers = subs.len(), "published");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_fifo_within_a_topic() {
        let bus = EventBus::new();
        let sub = bus.subscribe("t");
        bus.publish("t", serde_json::json!(1));
        bus.publish("t", serde_json::json!(2));
        assert_eq!(sub.recv().await.payload, serde_json::json!(1));
        assert_eq!(sub.recv().await.payload, serde_json::json!(2));
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_increments_counter() {
        let bus = EventBus::new();
        let sub = bus.subscribe_with_capacity("t", 2);
        bus.publish("t", serde_json::json!(1));
        bus.publish("t", serde_json::json!(2));
        bus.publish("t", serde_json::json!(3));
        assert_eq!(sub.overflow_count(), 1);
        assert_eq!(sub.recv().await.payload, serde_json::json!(2));
        assert_eq!(sub.recv().await.payload, serde_json::json!(3));
    }

    #[tokio::test]
    async fn publish_to_unknown_topic_is_a_noop() {
        let bus = EventBus::new();
        bus.publish("nobody:listening", serde_json::json!(null));
    }

    #[tokio::test]
    async fn unsubscribe_stops_further_delivery() {
        let bus = EventBus::new();
        let sub = bus.subscribe("t");
        drop(sub);
        // No subscriber left; publish must not panic and is a no-op.
        bus.publish("t", serde_json::json!(1));
        assert!(bus.inner.topics.read().get("t").is_none());
    }

    #[tokio::test]
    async fn independent_topics_do_not_cross_deliver() {
        let bus = EventBus::new();
        let sub_a = bus.subscribe("a");
        let sub_b = bus.subscribe("b");
        bus.publish("a", serde_json::json!("for-a"));
        assert_eq!(sub_a.recv().await.payload, serde_json::json!("for-a"));
        bus.publish("b", serde_json::json!("for-b"));
        assert_eq!(sub_b.recv().await.payload, serde_json::json!("for-b"));
    }
}
