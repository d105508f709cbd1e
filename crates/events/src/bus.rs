//! Notification publishing/subscription abstraction (mechanics only).
//!
//! The recoverability core raises lifecycle notifications (operation
//! waiting/preparing/forwarding/completed, messages submitted for retry,
//! messages failed in staging). A notification or UI layer consumes them.
//!
//! ## Delivery
//!
//! - **Best-effort**: the batch store is the source of truth; a lost
//!   notification never affects the retry pipeline.
//! - **Broadcast**: every subscription gets a copy of every notification.
//! - **At-least-once acceptable**: consumers must tolerate duplicates.

use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Duration;

use crate::notification::{Notification, RecoverabilityEvent};

/// A subscription to a notification stream.
///
/// Designed for single-threaded consumption. Messages arrive in publish order
/// for a single publisher.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain everything currently buffered.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}

/// Transport-agnostic pub/sub bus.
///
/// The trait requires `Send + Sync`; multiple threads may publish
/// concurrently.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}

/// Object-safe sink the recoverability core raises notifications into.
///
/// Every notification bus implements it; publish failures are logged and
/// swallowed because notifications are observability only.
pub trait DomainEvents: Send + Sync {
    fn raise(&self, event: RecoverabilityEvent);
}

impl<B> DomainEvents for B
where
    B: EventBus<Notification>,
{
    fn raise(&self, event: RecoverabilityEvent) {
        if let Err(err) = self.publish(Notification::new(event)) {
            tracing::warn!(error = ?err, "failed to publish recoverability notification");
        }
    }
}
