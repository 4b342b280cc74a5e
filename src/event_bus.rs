//! Typed publish/subscribe bus used for cross-component signalling.
//!
//! Every server in this crate (DHCP, DNS, HTTP, MQTT, the provisioning
//! client) runs on its own task and never calls into another component
//! directly except through here or through a mailbox (see each module's
//! `Handle`). Subscribers register for a concrete event type; broadcasting
//! an event delivers it to every subscriber whose declared type is an
//! ancestor of (or equal to) the event's dynamic type. "Ancestor" for our
//! purposes is just `Any::type_id` equality plus an explicit supertype list
//! events can register, since Rust has no runtime class hierarchy to walk.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};

/// Implemented by every event broadcast on the bus. `ancestors` lists the
/// additional type ids a subscriber may register under to receive this
/// event — e.g. an `OtaEvent::Progress` might also want to match subscribers
/// listening for the broader `OtaEvent` family.
pub trait Event: Any + Send + Sync + fmt::Debug {
    fn ancestors(&self) -> &'static [TypeId] {
        &[]
    }
}

type AnyEvent = Arc<dyn Any + Send + Sync>;

struct Topic {
    sender: broadcast::Sender<AnyEvent>,
}

/// Central event bus. Cheaply cloneable; every component holds one handle.
#[derive(Clone)]
pub struct EventBus {
    topics: Arc<Mutex<HashMap<TypeId, Topic>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            topics: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn topic_sender(&self, id: TypeId) -> broadcast::Sender<AnyEvent> {
        let mut topics = self.topics.lock();
        topics
            .entry(id)
            .or_insert_with(|| Topic {
                sender: broadcast::channel(256).0,
            })
            .sender
            .clone()
    }

    /// Broadcasts `event` to every current subscriber of `T` (or a
    /// supertype `T` declares itself an ancestor of). Broadcast order is
    /// preserved per-subscriber because each subscriber reads its own
    /// `broadcast::Receiver` in order.
    pub fn publish<T: Event + 'static>(&self, event: T) {
        let type_id = TypeId::of::<T>();
        let mut ids = vec![type_id];
        ids.extend_from_slice(event.ancestors());

        let boxed: AnyEvent = Arc::new(event);
        for id in ids {
            let sender = self.topic_sender(id);
            // No subscribers is not an error: the contract in spec §4.1
            // only requires that *something* observe the event eventually,
            // which debug builds could enforce with a Drop-time flag; we
            // keep that as a future hook rather than failing sends here.
            let _ = sender.send(Arc::clone(&boxed));
        }
    }

    /// Subscribes to every future broadcast of `T`. The returned stream
    /// must be polled with `.recv().await` in a loop; lagged receivers
    /// silently resynchronize (old events are simply skipped), matching
    /// `tokio::sync::broadcast`'s default behavior.
    pub fn subscribe<T: Event + 'static>(&self) -> Subscription<T> {
        let type_id = TypeId::of::<T>();
        let sender = self.topic_sender(type_id);
        Subscription {
            receiver: sender.subscribe(),
            _marker: std::marker::PhantomData,
        }
    }

    /// Returns a one-shot future that resolves with the next broadcast
    /// event of type `T` for which `predicate` returns `true`. The
    /// subscription is automatically dropped once resolved.
    pub async fn await_one<T, F>(&self, predicate: F) -> T
    where
        T: Event + Clone + 'static,
        F: Fn(&T) -> bool,
    {
        let mut sub = self.subscribe::<T>();
        loop {
            if let Some(event) = sub.recv().await {
                if predicate(&event) {
                    return event;
                }
            }
        }
    }

    /// Returns a one-shot channel pre-wired to resolve from a single
    /// broadcast; useful when the caller wants to `select!` against other
    /// futures instead of awaiting inline.
    pub fn await_one_channel<T, F>(&self, predicate: F) -> oneshot::Receiver<T>
    where
        T: Event + Clone + 'static,
        F: Fn(&T) -> bool + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let bus = self.clone();
        tokio::spawn(async move {
            let event = bus.await_one(predicate).await;
            let _ = tx.send(event);
        });
        rx
    }
}

/// A live subscription to broadcasts of `T`.
pub struct Subscription<T> {
    receiver: broadcast::Receiver<AnyEvent>,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Event + Clone + 'static> Subscription<T> {
    /// Awaits the next matching event, skipping past any the broadcast
    /// channel reports as lagged.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            match self.receiver.recv().await {
                Ok(any) => {
                    if let Some(event) = any.downcast_ref::<T>() {
                        return Some(event.clone());
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Ping(u32);
    impl Event for Ping {}

    #[tokio::test]
    async fn broadcast_preserves_order_per_subscriber() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe::<Ping>();
        bus.publish(Ping(1));
        bus.publish(Ping(2));
        bus.publish(Ping(3));
        assert_eq!(sub.recv().await, Some(Ping(1)));
        assert_eq!(sub.recv().await, Some(Ping(2)));
        assert_eq!(sub.recv().await, Some(Ping(3)));
    }

    #[tokio::test]
    async fn await_one_resolves_and_self_cancels() {
        let bus = EventBus::new();
        let bus2 = bus.clone();
        let handle = tokio::spawn(async move { bus2.await_one::<Ping, _>(|p| p.0 == 2).await });
        tokio::task::yield_now().await;
        bus.publish(Ping(1));
        bus.publish(Ping(2));
        let resolved = handle.await.unwrap();
        assert_eq!(resolved, Ping(2));
    }
}
