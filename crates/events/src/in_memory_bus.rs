//! In-memory notification bus for tests/dev and single-process hosts.

use std::sync::{Mutex, MutexGuard, PoisonError, mpsc};

use tracing::trace;

use crate::bus::{EventBus, Subscription};

#[derive(Debug, thiserror::Error)]
pub enum InMemoryBusError {
    #[error("notification bus lock poisoned")]
    Poisoned,
}

type Filter<M> = Box<dyn Fn(&M) -> bool + Send + Sync>;

struct Subscriber<M> {
    sender: mpsc::Sender<M>,
    filter: Option<Filter<M>>,
}

impl<M: Clone> Subscriber<M> {
    fn wants(&self, message: &M) -> bool {
        self.filter.as_ref().is_none_or(|filter| filter(message))
    }

    /// False once the receiving side is gone.
    fn deliver(&self, message: &M) -> bool {
        self.sender.send(message.clone()).is_ok()
    }
}

/// Broadcast bus over std channels.
///
/// Subscriptions may carry a filter; a notification is cloned only for the
/// subscribers that want it. Subscriptions whose receiver was dropped are
/// pruned the next time a notification reaches them.
pub struct InMemoryEventBus<M> {
    subscribers: Mutex<Vec<Subscriber<M>>>,
}

impl<M> InMemoryEventBus<M> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers().len()
    }

    // Subscribing never fails; a poisoned list is still a valid list.
    fn subscribers(&self) -> MutexGuard<'_, Vec<Subscriber<M>>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add(&self, filter: Option<Filter<M>>) -> Subscription<M> {
        let (sender, receiver) = mpsc::channel();
        self.subscribers().push(Subscriber { sender, filter });
        Subscription::new(receiver)
    }

    /// Subscribe to the notifications `filter` accepts.
    pub fn subscribe_where<F>(&self, filter: F) -> Subscription<M>
    where
        F: Fn(&M) -> bool + Send + Sync + 'static,
    {
        self.add(Some(Box::new(filter)))
    }
}

impl<M> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

impl<M> std::fmt::Debug for InMemoryEventBus<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryEventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl<M> EventBus<M> for InMemoryEventBus<M>
where
    M: Clone + Send + 'static,
{
    type Error = InMemoryBusError;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        let mut subscribers = self.subscribers.lock().map_err(|_| InMemoryBusError::Poisoned)?;
        let before = subscribers.len();
        let mut delivered = 0usize;

        subscribers.retain(|subscriber| {
            if !subscriber.wants(&message) {
                return true;
            }
            let alive = subscriber.deliver(&message);
            delivered += usize::from(alive);
            alive
        });

        trace!(delivered, pruned = before - subscribers.len(), "notification published");
        Ok(())
    }

    fn subscribe(&self) -> Subscription<M> {
        self.add(None)
    }
}
