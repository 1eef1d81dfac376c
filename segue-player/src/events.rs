//! Publish/subscribe for player events
//!
//! Handlers run synchronously in registration order. Dispatch iterates over a
//! snapshot of the handler list, so handlers may subscribe or unsubscribe
//! (including themselves) while an event is being delivered. Every event is
//! also sent on a broadcast channel for async consumers.

use segue_common::{EventTopic, PlayerEvent};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Capacity of the broadcast stream
const STREAM_CAPACITY: usize = 256;

pub type Handler = Arc<dyn Fn(&PlayerEvent) + Send + Sync>;

/// Token returned by [`EventBus::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

#[derive(Clone)]
struct Subscription {
    id: SubscriptionId,
    topic: EventTopic,
    handler: Handler,
    /// Set once a `once` handler has been claimed by a dispatch
    fired: Option<Arc<AtomicBool>>,
}

pub struct EventBus {
    subscriptions: Mutex<Vec<Subscription>>,
    tx: broadcast::Sender<PlayerEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriptions", &self.subscriber_count())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(STREAM_CAPACITY);
        Self {
            subscriptions: Mutex::new(Vec::new()),
            tx,
        }
    }

    fn subscriptions(&self) -> MutexGuard<'_, Vec<Subscription>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe<F>(&self, topic: EventTopic, handler: F) -> SubscriptionId
    where
        F: Fn(&PlayerEvent) + Send + Sync + 'static,
    {
        self.add(topic, Arc::new(handler), None)
    }

    /// Subscribe a handler that runs for the first matching event only
    pub fn once<F>(&self, topic: EventTopic, handler: F) -> SubscriptionId
    where
        F: Fn(&PlayerEvent) + Send + Sync + 'static,
    {
        self.add(topic, Arc::new(handler), Some(Arc::new(AtomicBool::new(false))))
    }

    fn add(&self, topic: EventTopic, handler: Handler, fired: Option<Arc<AtomicBool>>) -> SubscriptionId {
        let id = SubscriptionId(Uuid::new_v4());
        self.subscriptions().push(Subscription {
            id,
            topic,
            handler,
            fired,
        });
        id
    }

    /// Returns whether the subscription existed
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.subscriptions();
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != id);
        subscriptions.len() != before
    }

    pub fn unsubscribe_all(&self) {
        self.subscriptions().clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriptions().len()
    }

    /// Receiver for every event published from now on
    pub fn stream(&self) -> broadcast::Receiver<PlayerEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: PlayerEvent) {
        let topic = event.topic();
        let snapshot: Vec<Subscription> = self
            .subscriptions()
            .iter()
            .filter(|s| s.topic == topic)
            .cloned()
            .collect();

        for subscription in snapshot {
            if let Some(fired) = &subscription.fired {
                if fired.swap(true, Ordering::SeqCst) {
                    continue;
                }
                (subscription.handler)(&event);
                self.unsubscribe(subscription.id);
            } else {
                (subscription.handler)(&event);
            }
        }

        // No receivers is fine
        let _ = self.tx.send(event);
    }
}
