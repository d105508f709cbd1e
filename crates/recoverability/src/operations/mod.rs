//! Operation progress tracking for retries and archives.

mod archive;
mod retry;

pub use archive::{ArchiveOperation, ArchiveOperationStatus, ArchivingManager};
pub use retry::{AdoptedBatch, InMemoryRetry, RetryOperationStatus, RetryingManager};
