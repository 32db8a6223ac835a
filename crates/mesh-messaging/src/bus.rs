//! Topic-typed in-process publish/subscribe.
//!
//! Publishing never blocks: each subscription owns a bounded ring, and a
//! subscriber that falls behind loses its oldest unread events (counted by
//! the `mesh_events_dropped_total` metric) rather than stalling the
//! publisher. Ordering is FIFO per subscriber; there is no replay.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use metrics::counter;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::event::{Event, Topic};

/// Default per-subscription buffer capacity.
const DEFAULT_CAPACITY: usize = 128;

/// Unique identifier for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric value.
    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

struct SubscriberEntry {
    topics: HashSet<Topic>,
    tx: broadcast::Sender<Event>,
}

struct BrokerInner {
    subscribers: RwLock<HashMap<SubscriptionId, SubscriberEntry>>,
    capacity: usize,
}

/// The process-wide event bus.
///
/// Cheap to clone; all clones publish into the same subscriber set.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    /// Create a broker with the default per-subscription capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a broker with a custom per-subscription buffer capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                subscribers: RwLock::new(HashMap::new()),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Subscribe to one or more topics.
    ///
    /// Events published to any listed topic are delivered to the returned
    /// subscription in publish order. Dropping the subscription (or calling
    /// [`Broker::unsubscribe`]) removes it.
    pub fn subscribe(&self, topics: impl IntoIterator<Item = Topic>) -> Subscription {
        let id = SubscriptionId::next();
        let (tx, rx) = broadcast::channel(self.inner.capacity);
        let topics: HashSet<Topic> = topics.into_iter().collect();

        debug!(subscription = %id, topics = topics.len(), "subscribed");

        self.inner
            .subscribers
            .write()
            .expect("subscriber lock poisoned")
            .insert(id, SubscriberEntry { topics, tx });

        Subscription {
            id,
            rx,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Remove a subscription by ID.
    ///
    /// Safe to call for a subscription that was already removed.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        if self
            .inner
            .subscribers
            .write()
            .expect("subscriber lock poisoned")
            .remove(&id)
            .is_some()
        {
            debug!(subscription = %id, "unsubscribed");
        }
    }

    /// Deliver an event to every current subscriber of its topic.
    ///
    /// Never blocks. Subscribers that have fallen `capacity` events behind
    /// lose their oldest unread events.
    pub fn publish(&self, event: Event) {
        let subscribers = self
            .inner
            .subscribers
            .read()
            .expect("subscriber lock poisoned");

        let mut delivered = 0usize;
        for entry in subscribers.values() {
            if entry.topics.contains(&event.topic) {
                // send only fails when the receiver is gone; the Drop impl
                // on Subscription will clean the entry up.
                if entry.tx.send(event.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }

        trace!(topic = %event.topic, delivered, "published event");
    }

    /// Number of live subscriptions, across all topics.
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .read()
            .expect("subscriber lock poisoned")
            .len()
    }

    /// Drop every subscription, closing all subscriber streams.
    ///
    /// Subscribers observe the close as end-of-stream from
    /// [`Subscription::recv`].
    pub fn shutdown(&self) {
        let mut subscribers = self
            .inner
            .subscribers
            .write()
            .expect("subscriber lock poisoned");
        let drained = subscribers.len();
        subscribers.clear();
        debug!(drained, "event bus shut down");
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("subscribers", &self.subscriber_count())
            .field("capacity", &self.inner.capacity)
            .finish()
    }
}

/// A live subscription on the bus.
pub struct Subscription {
    id: SubscriptionId,
    rx: broadcast::Receiver<Event>,
    inner: Arc<BrokerInner>,
}

impl Subscription {
    /// This subscription's ID.
    #[inline]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Receive the next event.
    ///
    /// Returns `None` once the subscription has been removed or the bus has
    /// shut down. If the subscriber lagged, the missed (oldest) events are
    /// skipped and counted; delivery resumes with the oldest retained event.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    counter!("mesh_events_dropped_total").increment(missed);
                    warn!(
                        subscription = %self.id,
                        missed,
                        "slow subscriber dropped oldest events"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.inner
            .subscribers
            .write()
            .expect("subscriber lock poisoned")
            .remove(&self.id);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
