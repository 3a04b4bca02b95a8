//! Per-session event bus
//!
//! Ordered, multi-subscriber dispatch. Subscribers are either synchronous
//! handlers or channel receivers; both receive every published event in
//! registration order and can be removed with the id returned at subscribe
//! time.

use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::trace;

/// Handle identifying one subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

enum Subscriber<E> {
    Handler(Handler<E>),
    Channel(mpsc::UnboundedSender<E>),
}

impl<E> Clone for Subscriber<E> {
    fn clone(&self) -> Self {
        match self {
            Subscriber::Handler(handler) => Subscriber::Handler(handler.clone()),
            Subscriber::Channel(sender) => Subscriber::Channel(sender.clone()),
        }
    }
}

struct BusInner<E> {
    next_id: u64,
    subscribers: Vec<(SubscriptionId, Subscriber<E>)>,
}

/// Multi-subscriber event bus
pub struct EventBus<E> {
    inner: Mutex<BusInner<E>>,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(BusInner {
                next_id: 0,
                subscribers: Vec::new(),
            }),
        }
    }
}

impl<E> std::fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl<E: Clone + Send + 'static> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a synchronous handler
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.register(Subscriber::Handler(Arc::new(handler)))
    }

    /// Register a channel subscriber
    pub fn subscribe_channel(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<E>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (self.register(Subscriber::Channel(tx)), rx)
    }

    fn register(&self, subscriber: Subscriber<E>) -> SubscriptionId {
        let mut inner = self.lock();
        let id = SubscriptionId(inner.next_id);
        inner.next_id += 1;
        inner.subscribers.push((id, subscriber));
        id
    }

    /// Remove a subscription; returns false if it was unknown
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.lock();
        let before = inner.subscribers.len();
        inner.subscribers.retain(|(existing, _)| *existing != id);
        inner.subscribers.len() != before
    }

    /// Dispatch to every subscriber in registration order
    ///
    /// Returns the number of subscribers reached. Channel subscribers whose
    /// receiver was dropped are pruned.
    pub fn publish(&self, event: E) -> usize {
        // Dispatch outside the lock so handlers may (un)subscribe
        let snapshot: Vec<(SubscriptionId, Subscriber<E>)> = self.lock().subscribers.clone();

        let mut delivered = 0;
        let mut closed = Vec::new();
        for (id, subscriber) in &snapshot {
            match subscriber {
                Subscriber::Handler(handler) => {
                    handler(&event);
                    delivered += 1;
                }
                Subscriber::Channel(sender) => {
                    if sender.send(event.clone()).is_ok() {
                        delivered += 1;
                    } else {
                        closed.push(*id);
                    }
                }
            }
        }

        if !closed.is_empty() {
            trace!(count = closed.len(), "Pruning closed event subscribers");
            self.lock()
                .subscribers
                .retain(|(id, _)| !closed.contains(id));
        }
        delivered
    }
}

impl<E> EventBus<E> {
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Drop every subscription; channel receivers observe end-of-stream
    pub fn clear(&self) {
        self.lock().subscribers.clear();
    }

    fn lock(&self) -> MutexGuard<'_, BusInner<E>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn test_debug_reports_subscribers_for_any_event_type() {
        struct Opaque;
        let bus: EventBus<Opaque> = EventBus::default();
        assert_eq!(format!("{bus:?}"), "EventBus { subscribers: 0 }");
    }

    #[test]
    fn test_handlers_receive_in_registration_order() {
        let bus: EventBus<u32> = EventBus::new();
        let log = Arc::new(StdMutex::new(Vec::new()));

        let a = log.clone();
        bus.subscribe(move |e| a.lock().unwrap().push(("a", *e)));
        let b = log.clone();
        bus.subscribe(move |e| b.lock().unwrap().push(("b", *e)));

        assert_eq!(bus.publish(1), 2);
        bus.publish(2);

        assert_eq!(
            *log.lock().unwrap(),
            vec![("a", 1), ("b", 1), ("a", 2), ("b", 2)]
        );
    }

    #[test]
    fn test_unsubscribe() {
        let bus: EventBus<u32> = EventBus::new();
        let count = Arc::new(StdMutex::new(0));
        let c = count.clone();
        let id = bus.subscribe(move |_| *c.lock().unwrap() += 1);

        bus.publish(1);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.publish(2);
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_channel_subscriber_and_pruning() {
        let bus: EventBus<&'static str> = EventBus::new();
        let (_, mut rx) = bus.subscribe_channel();
        let (_, dropped) = bus.subscribe_channel();
        drop(dropped);

        assert_eq!(bus.publish("hello"), 1);
        assert_eq!(rx.recv().await, Some("hello"));
        assert_eq!(bus.subscriber_count(), 1);

        bus.clear();
        assert_eq!(rx.recv().await, None);
    }
}
