//! Error types of the recoverability core.

use thiserror::Error;

use busmon_core::{ArchiveType, DomainError, RequestId, RetryType};

pub use crate::store::StoreError;
pub use crate::transport::DispatchError;

/// Tracker lookup failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TrackerError {
    /// A mutating call referenced an operation that was never prepared.
    #[error("unknown operation {request_id} ({retry_type})")]
    UnknownOperation {
        request_id: RequestId,
        retry_type: RetryType,
    },
    #[error("unknown archive operation {request_id} ({archive_type:?})")]
    UnknownArchive {
        request_id: RequestId,
        archive_type: ArchiveType,
    },
    #[error("operation registry lock poisoned")]
    Poisoned,
}

/// Umbrella error for gateway/processor/document manager operations.
#[derive(Debug, Error)]
pub enum RecoverabilityError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("tracker error: {0}")]
    Tracker(#[from] TrackerError),

    #[error(transparent)]
    Domain(#[from] DomainError),
}

pub type RecoverabilityResult<T> = Result<T, RecoverabilityError>;
