//! Storage seams of the retry pipeline and their in-memory implementations.

mod batch_store;
mod failed_messages;
mod in_memory;

pub use batch_store::{BatchStore, QueryResult, SessionFilter, StoreError};
pub use failed_messages::{FailedMessageStore, InMemoryFailedMessageStore};
pub use in_memory::{InMemoryBatchStore, StoreOperation};
