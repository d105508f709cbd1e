//! Recoverability notifications and the pub/sub mechanics that carry them.

pub mod bus;
pub mod in_memory_bus;
pub mod notification;

pub use bus::{DomainEvents, EventBus, Subscription};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use notification::{ArchiveProgress, Notification, RecoverabilityEvent, RetryProgress};
