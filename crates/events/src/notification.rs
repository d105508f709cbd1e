//! Notification payloads raised by the recoverability core.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use busmon_core::{ArchiveState, ArchiveType, FailedMessageId, RequestId, RetryState, RetryType};

/// Point-in-time progress of a retry operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryProgress {
    pub state: RetryState,
    pub total: usize,
    pub prepared: usize,
    pub forwarded: usize,
    pub skipped: usize,
    pub percentage: f64,
    pub failed: bool,
}

/// Point-in-time progress of an archive operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveProgress {
    pub state: ArchiveState,
    pub total: usize,
    pub archived: usize,
    pub number_of_batches: usize,
    pub current_batch: usize,
    pub percentage: f64,
}

/// Operation-lifecycle and per-message notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecoverabilityEvent {
    RetryOperationWaiting {
        request_id: RequestId,
        retry_type: RetryType,
        progress: RetryProgress,
        started_at: DateTime<Utc>,
    },
    RetryOperationPreparing {
        request_id: RequestId,
        retry_type: RetryType,
        progress: RetryProgress,
        started_at: DateTime<Utc>,
    },
    RetryOperationForwarding {
        request_id: RequestId,
        retry_type: RetryType,
        progress: RetryProgress,
        started_at: DateTime<Utc>,
    },
    RetryOperationCompleted {
        request_id: RequestId,
        retry_type: RetryType,
        failed: bool,
        progress: RetryProgress,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        originator: Option<String>,
        classifier: Option<String>,
        last: Option<DateTime<Utc>>,
        number_of_messages_processed: usize,
    },
    /// Messages handed over for redispatch. `failed_message_ids` is empty for
    /// the summary raised when a failure-group operation completes.
    MessagesSubmittedForRetry {
        failed_message_ids: Vec<FailedMessageId>,
        number_of_failed_messages: usize,
        context: Option<String>,
    },
    /// A message exhausted its staging attempts and was dropped from its batch.
    MessageFailedInStaging { failed_message_id: FailedMessageId },
    ArchiveOperationStarting {
        request_id: RequestId,
        archive_type: ArchiveType,
        progress: ArchiveProgress,
        started_at: DateTime<Utc>,
    },
    ArchiveOperationBatchCompleted {
        request_id: RequestId,
        archive_type: ArchiveType,
        progress: ArchiveProgress,
        started_at: DateTime<Utc>,
    },
    ArchiveOperationFinalizing {
        request_id: RequestId,
        archive_type: ArchiveType,
        progress: ArchiveProgress,
        started_at: DateTime<Utc>,
    },
    ArchiveOperationCompleted {
        request_id: RequestId,
        archive_type: ArchiveType,
        progress: ArchiveProgress,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    },
}

impl RecoverabilityEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            RecoverabilityEvent::RetryOperationWaiting { .. } => "retry_operation_waiting",
            RecoverabilityEvent::RetryOperationPreparing { .. } => "retry_operation_preparing",
            RecoverabilityEvent::RetryOperationForwarding { .. } => "retry_operation_forwarding",
            RecoverabilityEvent::RetryOperationCompleted { .. } => "retry_operation_completed",
            RecoverabilityEvent::MessagesSubmittedForRetry { .. } => "messages_submitted_for_retry",
            RecoverabilityEvent::MessageFailedInStaging { .. } => "message_failed_in_staging",
            RecoverabilityEvent::ArchiveOperationStarting { .. } => "archive_operation_starting",
            RecoverabilityEvent::ArchiveOperationBatchCompleted { .. } => {
                "archive_operation_batch_completed"
            }
            RecoverabilityEvent::ArchiveOperationFinalizing { .. } => "archive_operation_finalizing",
            RecoverabilityEvent::ArchiveOperationCompleted { .. } => "archive_operation_completed",
        }
    }
}

/// Envelope for a raised event: identity and timestamp for consumers that
/// deduplicate or order notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    notification_id: Uuid,
    occurred_at: DateTime<Utc>,
    event: RecoverabilityEvent,
}

impl Notification {
    pub fn new(event: RecoverabilityEvent) -> Self {
        Self {
            notification_id: Uuid::now_v7(),
            occurred_at: Utc::now(),
            event,
        }
    }

    pub fn notification_id(&self) -> Uuid {
        self.notification_id
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn event_type(&self) -> &'static str {
        self.event.event_type()
    }

    pub fn event(&self) -> &RecoverabilityEvent {
        &self.event
    }

    pub fn into_event(self) -> RecoverabilityEvent {
        self.event
    }
}
