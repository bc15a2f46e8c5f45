use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::oneshot;

use super::Registry;

/// Settle slot shared by a waiter's registrations and its timer.
///
/// Claiming takes the sender out of the slot; only the first claimant gets it.
pub(crate) struct Settle<E>(Arc<Mutex<Option<oneshot::Sender<E>>>>);

impl<E> Clone for Settle<E> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<E> Settle<E> {
    pub(crate) fn new() -> (Self, oneshot::Receiver<E>) {
        let (tx, rx) = oneshot::channel();
        (Self(Arc::new(Mutex::new(Some(tx)))), rx)
    }

    pub(crate) fn claim(&self) -> Option<oneshot::Sender<E>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    pub(crate) fn is_settled(&self) -> bool {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).is_none()
    }
}

/// How a raced waiter resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<E> {
    Event(E),
    TimedOut,
    /// The bus was dropped before anything arrived.
    Closed,
}

impl<E> Outcome<E> {
    pub fn event(self) -> Option<E> {
        match self {
            Outcome::Event(event) => Some(event),
            _ => None,
        }
    }
}

/// One-shot registration created by `EventBus::once` / `EventBus::once_any`
///
/// Dropping a waiter removes its registrations, so an abandoned wait never
/// receives a late event.
pub struct Waiter<T: Eq + Hash, E> {
    id: u64,
    topics: Vec<T>,
    settle: Settle<E>,
    rx: oneshot::Receiver<E>,
    registry: Weak<Registry<T, E>>,
}

impl<T: Eq + Hash, E> Waiter<T, E> {
    pub(crate) fn new(
        id: u64,
        topics: Vec<T>,
        settle: Settle<E>,
        rx: oneshot::Receiver<E>,
        registry: Weak<Registry<T, E>>,
    ) -> Self {
        Self {
            id,
            topics,
            settle,
            rx,
            registry,
        }
    }

    /// Wait for the event with no deadline.
    pub async fn wait(mut self) -> Option<E> {
        (&mut self.rx).await.ok()
    }

    /// Wait for the event or `timeout`, whichever settles first.
    pub async fn race(mut self, timeout: Duration) -> Outcome<E> {
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        tokio::select! {
            biased;
            received = &mut self.rx => match received {
                Ok(event) => Outcome::Event(event),
                Err(_) => Outcome::Closed,
            },
            _ = &mut deadline => {
                if self.settle.claim().is_some() {
                    Outcome::TimedOut
                } else {
                    // A publisher claimed the slot first. It sends right after
                    // claiming, so the event may not be queued yet.
                    match (&mut self.rx).await {
                        Ok(event) => Outcome::Event(event),
                        Err(_) => Outcome::Closed,
                    }
                }
            }
        }
    }
}

impl<T: Eq + Hash, E> Drop for Waiter<T, E> {
    fn drop(&mut self) {
        self.settle.claim();
        if let Some(registry) = self.registry.upgrade() {
            registry.remove_waiter(&self.topics, self.id);
        }
    }
}
