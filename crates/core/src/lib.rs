//! `busmon-core` — domain primitives for the recoverability engine.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, operation enums and the progress calculator.

pub mod error;
pub mod id;
pub mod operation;
pub mod progress;

pub use error::{DomainError, DomainResult};
pub use id::{FailedMessageId, FailedMessageRetryId, RequestId, RetryBatchId, SessionId, StagingId};
pub use operation::{ArchiveState, ArchiveType, RetryState, RetryType};
pub use progress::{archive_percentage, retry_percentage};
