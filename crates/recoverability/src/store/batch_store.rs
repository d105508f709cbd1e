//! Persistence contract for retry batches, their member markers and the
//! forwarding marker.

use chrono::{DateTime, Utc};

use busmon_core::{
    DomainError, FailedMessageId, FailedMessageRetryId, RetryBatchId, SessionId, StagingId,
};

use crate::documents::{
    FailedMessageRetry, RetryBatch, RetryBatchGroup, RetryBatchNowForwarding, RetryBatchStatus,
};

/// Store error shared by the batch and failed-message stores.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("retry batch not found: {0}")]
    BatchNotFound(RetryBatchId),
    #[error("failed message not found: {0}")]
    MessageNotFound(FailedMessageId),
    #[error("failed message retry not found: {0}")]
    RetryNotFound(FailedMessageRetryId),
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<DomainError> for StoreError {
    fn from(err: DomainError) -> Self {
        StoreError::InvalidTransition(err.to_string())
    }
}

/// Which sessions a status query should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionFilter {
    Any,
    /// Batches of every session but this one.
    Except(SessionId),
}

impl SessionFilter {
    pub fn accepts(&self, session: SessionId) -> bool {
        match self {
            SessionFilter::Any => true,
            SessionFilter::Except(s) => *s != session,
        }
    }
}

/// Query result from an eventually consistent index.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult<T> {
    pub results: Vec<T>,
    /// The index had not caught up; callers should poll again.
    pub is_stale: bool,
}

/// Batch store abstraction.
///
/// Status changes only move forward; implementations reject anything else
/// with [`StoreError::InvalidTransition`].
#[async_trait::async_trait]
pub trait BatchStore: Send + Sync {
    /// Persist a new batch (status MarkingDocuments).
    async fn create_batch(&self, batch: RetryBatch) -> Result<RetryBatchId, StoreError>;

    async fn get_batch(&self, batch_id: RetryBatchId) -> Result<Option<RetryBatch>, StoreError>;

    /// Upsert one marker per message, claiming it for `batch_id`. An existing
    /// marker is re-pointed at this batch, superseding its previous claim.
    async fn link_members(
        &self,
        batch_id: RetryBatchId,
        messages: &[FailedMessageId],
    ) -> Result<(), StoreError>;

    async fn move_to_staging(&self, batch_id: RetryBatchId) -> Result<(), StoreError>;

    async fn move_to_forwarding(
        &self,
        batch_id: RetryBatchId,
        staging_id: StagingId,
        staged: Vec<FailedMessageRetryId>,
    ) -> Result<(), StoreError>;

    /// Returns false when the batch was already gone.
    async fn delete_batch(&self, batch_id: RetryBatchId) -> Result<bool, StoreError>;

    /// Batches in `status`, oldest first.
    async fn query_by_status(
        &self,
        status: RetryBatchStatus,
        sessions: SessionFilter,
    ) -> Result<Vec<RetryBatch>, StoreError>;

    /// Batches still marking documents, owned by another session and created
    /// before `cutoff`.
    async fn query_orphaned(
        &self,
        current_session: SessionId,
        cutoff: DateTime<Utc>,
    ) -> Result<QueryResult<RetryBatch>, StoreError>;

    /// Move orphaned batches straight to Staging under `session`. Batches that
    /// have already moved on are skipped. Returns the adopted batches.
    async fn adopt_batches(
        &self,
        batch_ids: &[RetryBatchId],
        session: SessionId,
    ) -> Result<Vec<RetryBatch>, StoreError>;

    /// Batches in Staging or Forwarding grouped by request id and retry type.
    /// Staging batches count their initial size, forwarding batches the
    /// members they staged.
    async fn batch_groups(&self) -> Result<Vec<RetryBatchGroup>, StoreError>;

    /// Missing markers are skipped.
    async fn load_failure_retries(
        &self,
        ids: &[FailedMessageRetryId],
    ) -> Result<Vec<FailedMessageRetry>, StoreError>;

    /// Returns the new attempt count.
    async fn increment_stage_attempts(&self, id: FailedMessageRetryId) -> Result<u32, StoreError>;

    async fn delete_failure_retry(&self, id: FailedMessageRetryId) -> Result<(), StoreError>;

    /// Delete those of `ids` still claimed by `batch_id`. Returns how many
    /// were removed.
    async fn release_failure_retries(
        &self,
        batch_id: RetryBatchId,
        ids: &[FailedMessageRetryId],
    ) -> Result<usize, StoreError>;

    /// Atomic create-if-absent of the singleton forwarding marker. Returns
    /// false if a marker already exists.
    async fn insert_forwarding_marker(
        &self,
        marker: RetryBatchNowForwarding,
    ) -> Result<bool, StoreError>;

    async fn forwarding_marker(&self) -> Result<Option<RetryBatchNowForwarding>, StoreError>;

    /// Delete the marker only if it points at `batch_id`. Returns whether it
    /// was removed.
    async fn delete_forwarding_marker(&self, batch_id: RetryBatchId) -> Result<bool, StoreError>;
}
