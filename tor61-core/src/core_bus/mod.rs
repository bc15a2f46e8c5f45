//! Event correlation bus
//!
//! Publish/subscribe keyed by a typed topic, plus one-shot waiters that let a
//! caller await one specific reply among many interleaved events.
//!
//! Delivery never runs handler code on the publisher's stack: persistent
//! subscribers read from their own channel on their own task, and one-shot
//! waiters are woken through a oneshot channel.
//!
//! A waiter is raced against a timer with [`Waiter::race`]. Both sides share a
//! settle slot; whichever side claims it first wins, so a late timer never
//! reports a failure for a waiter that already fired, and an event published
//! after the timeout finds nothing to deliver to.

mod waiter;

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

pub use waiter::{Outcome, Waiter};
use waiter::Settle;

/// Persistent subscription to one topic
pub struct Subscription<E> {
    rx: mpsc::UnboundedReceiver<E>,
}

impl<E> Subscription<E> {
    /// Next event, or `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<E> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<E> {
        self.rx.try_recv().ok()
    }
}

pub(crate) struct WaiterSlot<E> {
    id: u64,
    settle: Settle<E>,
}

pub(crate) struct Registry<T, E> {
    subscribers: Mutex<HashMap<T, Vec<mpsc::UnboundedSender<E>>>>,
    waiters: Mutex<HashMap<T, Vec<WaiterSlot<E>>>>,
    next_waiter: AtomicU64,
}

fn lock<X>(mutex: &Mutex<X>) -> MutexGuard<'_, X> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T: Eq + Hash, E> Registry<T, E> {
    pub(crate) fn remove_waiter(&self, topics: &[T], id: u64) {
        let mut waiters = lock(&self.waiters);
        for topic in topics {
            if let Some(slots) = waiters.get_mut(topic) {
                slots.retain(|slot| slot.id != id);
                if slots.is_empty() {
                    waiters.remove(topic);
                }
            }
        }
    }
}

/// Cheaply cloneable handle to a shared bus
pub struct EventBus<T, E> {
    inner: Arc<Registry<T, E>>,
}

impl<T, E> Clone for EventBus<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T, E> Default for EventBus<T, E>
where
    T: Eq + Hash + Clone,
    E: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> EventBus<T, E>
where
    T: Eq + Hash + Clone,
    E: Clone,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Registry {
                subscribers: Mutex::new(HashMap::new()),
                waiters: Mutex::new(HashMap::new()),
                next_waiter: AtomicU64::new(1),
            }),
        }
    }

    /// Receive every event published on `topic` from now on.
    pub fn subscribe(&self, topic: T) -> Subscription<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.inner.subscribers)
            .entry(topic)
            .or_default()
            .push(tx);
        Subscription { rx }
    }

    /// Receive the next event published on `topic`, once.
    pub fn once(&self, topic: T) -> Waiter<T, E> {
        self.once_any([topic])
    }

    /// Receive the next event published on any of `topics`, once.
    ///
    /// The waiter must be registered before the request that provokes the
    /// reply is sent, otherwise a fast reply can be missed.
    pub fn once_any<I>(&self, topics: I) -> Waiter<T, E>
    where
        I: IntoIterator<Item = T>,
    {
        let id = self.inner.next_waiter.fetch_add(1, Ordering::Relaxed);
        let (settle, rx) = Settle::new();
        let topics: Vec<T> = topics.into_iter().collect();

        {
            let mut waiters = lock(&self.inner.waiters);
            for topic in &topics {
                waiters.entry(topic.clone()).or_default().push(WaiterSlot {
                    id,
                    settle: settle.clone(),
                });
            }
        }

        Waiter::new(id, topics, settle, rx, Arc::downgrade(&self.inner))
    }

    /// Deliver `event` to every subscriber and pending waiter of `topic`.
    ///
    /// Returns how many receivers the event was handed to.
    pub fn publish(&self, topic: T, event: E) -> usize {
        let mut delivered = 0;

        {
            let mut subscribers = lock(&self.inner.subscribers);
            if let Some(list) = subscribers.get_mut(&topic) {
                list.retain(|tx| tx.send(event.clone()).is_ok());
                delivered += list.len();
                if list.is_empty() {
                    subscribers.remove(&topic);
                }
            }
        }

        let slots = lock(&self.inner.waiters).remove(&topic).unwrap_or_default();
        for slot in slots {
            if let Some(tx) = slot.settle.claim() {
                if tx.send(event.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }

        delivered
    }

    pub fn subscriber_count(&self, topic: &T) -> usize {
        lock(&self.inner.subscribers)
            .get(topic)
            .map(|list| list.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    pub fn waiter_count(&self, topic: &T) -> usize {
        lock(&self.inner.waiters)
            .get(topic)
            .map(|slots| slots.iter().filter(|slot| !slot.settle.is_settled()).count())
            .unwrap_or(0)
    }
}
