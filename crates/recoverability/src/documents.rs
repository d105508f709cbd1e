//! Durable documents of the retry pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use busmon_core::{
    DomainError, FailedMessageId, FailedMessageRetryId, RequestId, RetryBatchId, RetryType,
    SessionId, StagingId,
};

/// Lifecycle of a retry batch. Only moves forward; a batch is deleted once
/// forwarding completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryBatchStatus {
    /// Created; member markers are still being linked.
    MarkingDocuments,
    /// Members linked, waiting for the processor to stage them.
    Staging,
    /// Staged; the processor will redispatch the staged messages.
    Forwarding,
}

impl RetryBatchStatus {
    fn rank(self) -> u8 {
        match self {
            RetryBatchStatus::MarkingDocuments => 0,
            RetryBatchStatus::Staging => 1,
            RetryBatchStatus::Forwarding => 2,
        }
    }

    /// True when `next` is the immediate successor of `self`.
    pub fn can_advance_to(self, next: RetryBatchStatus) -> bool {
        next.rank() == self.rank() + 1
    }
}

/// A durable unit of retry work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryBatch {
    pub id: RetryBatchId,
    /// Process incarnation that owns the batch.
    pub session_id: SessionId,
    pub status: RetryBatchStatus,
    /// `None` for batches that predate operation tracking.
    pub request_id: Option<RequestId>,
    pub retry_type: RetryType,
    pub initial_batch_size: usize,
    /// Member markers, in insertion order, without duplicates.
    pub failure_retries: Vec<FailedMessageRetryId>,
    pub staging_id: Option<StagingId>,
    pub originator: Option<String>,
    pub classifier: Option<String>,
    pub start_time: DateTime<Utc>,
    /// Latest original-failure timestamp among the members.
    pub last: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl RetryBatch {
    pub fn new(
        session_id: SessionId,
        request_id: Option<RequestId>,
        retry_type: RetryType,
        failure_retries: Vec<FailedMessageRetryId>,
        start_time: DateTime<Utc>,
    ) -> Self {
        let mut members = Vec::with_capacity(failure_retries.len());
        for id in failure_retries {
            if !members.contains(&id) {
                members.push(id);
            }
        }

        Self {
            id: RetryBatchId::new(),
            session_id,
            status: RetryBatchStatus::MarkingDocuments,
            request_id,
            retry_type,
            initial_batch_size: members.len(),
            failure_retries: members,
            staging_id: None,
            originator: None,
            classifier: None,
            start_time,
            last: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_originator(mut self, originator: Option<String>) -> Self {
        self.originator = originator;
        self
    }

    pub fn with_classifier(mut self, classifier: Option<String>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_last(mut self, last: Option<DateTime<Utc>>) -> Self {
        self.last = last;
        self
    }

    fn advance(&mut self, next: RetryBatchStatus) -> Result<(), DomainError> {
        if !self.status.can_advance_to(next) {
            return Err(DomainError::invariant(format!(
                "retry batch {} cannot move from {:?} to {:?}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    /// Members are linked; hand the batch to the processor.
    pub fn mark_staging(&mut self) -> Result<(), DomainError> {
        self.advance(RetryBatchStatus::Staging)
    }

    /// Take over a batch abandoned mid-creation by another session.
    pub fn adopt(&mut self, session_id: SessionId) -> Result<(), DomainError> {
        self.advance(RetryBatchStatus::Staging)?;
        self.session_id = session_id;
        Ok(())
    }

    /// Staging succeeded; keep only the members actually staged.
    pub fn mark_forwarding(
        &mut self,
        staging_id: StagingId,
        staged: Vec<FailedMessageRetryId>,
    ) -> Result<(), DomainError> {
        self.advance(RetryBatchStatus::Forwarding)?;
        self.staging_id = Some(staging_id);
        self.failure_retries = staged;
        Ok(())
    }
}

/// Per-message marker linking one failed message to at most one active batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedMessageRetry {
    pub id: FailedMessageRetryId,
    pub failed_message_id: FailedMessageId,
    pub retry_batch_id: RetryBatchId,
    pub stage_attempts: u32,
}

impl FailedMessageRetry {
    pub fn new(failed_message_id: FailedMessageId, retry_batch_id: RetryBatchId) -> Self {
        Self {
            id: FailedMessageRetryId::for_message(&failed_message_id),
            failed_message_id,
            retry_batch_id,
            stage_attempts: 0,
        }
    }

    /// A marker re-claimed by a newer batch is superseded for every other batch.
    pub fn is_claimed_by(&self, batch_id: RetryBatchId) -> bool {
        self.retry_batch_id == batch_id
    }
}

/// Singleton marker naming the one batch currently forwarding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryBatchNowForwarding {
    pub retry_batch_id: RetryBatchId,
}

/// Aggregate view over in-flight batches of one operation, used to rebuild
/// tracker state after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryBatchGroup {
    pub request_id: Option<RequestId>,
    pub retry_type: RetryType,
    pub has_staging_batches: bool,
    pub has_forwarding_batches: bool,
    /// Messages still to be accounted for: initial size of staging batches
    /// plus the staged members of forwarding batches.
    pub initial_batch_size: usize,
    pub originator: Option<String>,
    pub classifier: Option<String>,
    pub start_time: DateTime<Utc>,
    pub last: Option<DateTime<Utc>>,
}
