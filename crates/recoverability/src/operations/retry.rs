//! In-memory progress of retry operations.
//!
//! The batch store is the source of truth. Everything here is observability
//! state: it can be lost and is rebuilt from in-flight batches on start.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use busmon_core::{RequestId, RetryState, RetryType, retry_percentage};
use busmon_events::{DomainEvents, RecoverabilityEvent, RetryProgress};

use crate::error::TrackerError;

/// Progress of one retry operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InMemoryRetry {
    pub request_id: RequestId,
    pub retry_type: RetryType,
    pub state: RetryState,
    pub total_number_of_messages: usize,
    pub number_of_messages_prepared: usize,
    pub number_of_messages_forwarded: usize,
    pub number_of_messages_skipped: usize,
    /// Sticky; survives completion.
    pub failed: bool,
    pub originator: Option<String>,
    pub classifier: Option<String>,
    pub started: DateTime<Utc>,
    pub last: Option<DateTime<Utc>>,
    pub completion_time: Option<DateTime<Utc>>,
}

impl InMemoryRetry {
    pub fn new(request_id: RequestId, retry_type: RetryType) -> Self {
        Self {
            request_id,
            retry_type,
            state: RetryState::Waiting,
            total_number_of_messages: 0,
            number_of_messages_prepared: 0,
            number_of_messages_forwarded: 0,
            number_of_messages_skipped: 0,
            failed: false,
            originator: None,
            classifier: None,
            started: Utc::now(),
            last: None,
            completion_time: None,
        }
    }

    pub fn percentage(&self) -> f64 {
        retry_percentage(
            self.total_number_of_messages,
            self.number_of_messages_prepared,
            self.number_of_messages_forwarded,
            self.number_of_messages_skipped,
            self.state,
        )
    }

    pub fn progress(&self) -> RetryProgress {
        RetryProgress {
            state: self.state,
            total: self.total_number_of_messages,
            prepared: self.number_of_messages_prepared,
            forwarded: self.number_of_messages_forwarded,
            skipped: self.number_of_messages_skipped,
            percentage: self.percentage(),
            failed: self.failed,
        }
    }

    /// Requested but not yet sized, or finished.
    pub fn is_in_progress(&self) -> bool {
        !matches!(self.state, RetryState::Waiting | RetryState::Completed)
    }

    fn waiting_event(&self) -> RecoverabilityEvent {
        RecoverabilityEvent::RetryOperationWaiting {
            request_id: self.request_id.clone(),
            retry_type: self.retry_type,
            progress: self.progress(),
            started_at: self.started,
        }
    }

    fn preparing_event(&self) -> RecoverabilityEvent {
        RecoverabilityEvent::RetryOperationPreparing {
            request_id: self.request_id.clone(),
            retry_type: self.retry_type,
            progress: self.progress(),
            started_at: self.started,
        }
    }

    fn forwarding_event(&self) -> RecoverabilityEvent {
        RecoverabilityEvent::RetryOperationForwarding {
            request_id: self.request_id.clone(),
            retry_type: self.retry_type,
            progress: self.progress(),
            started_at: self.started,
        }
    }

    fn wait(
        &mut self,
        started: DateTime<Utc>,
        originator: Option<String>,
        classifier: Option<String>,
        last: Option<DateTime<Utc>>,
    ) -> Vec<RecoverabilityEvent> {
        self.state = RetryState::Waiting;
        self.total_number_of_messages = 0;
        self.number_of_messages_prepared = 0;
        self.number_of_messages_forwarded = 0;
        self.number_of_messages_skipped = 0;
        self.completion_time = None;
        self.started = started;
        self.originator = originator;
        self.classifier = classifier;
        self.last = last;
        vec![self.waiting_event()]
    }

    fn prepare(&mut self, total: usize) -> Vec<RecoverabilityEvent> {
        self.state = RetryState::Preparing;
        self.total_number_of_messages = total;
        self.number_of_messages_prepared = 0;
        self.number_of_messages_forwarded = 0;
        self.number_of_messages_skipped = 0;
        self.completion_time = None;
        vec![self.preparing_event()]
    }

    fn prepare_batch(&mut self, prepared: usize) -> Vec<RecoverabilityEvent> {
        self.number_of_messages_prepared = prepared;
        vec![self.preparing_event()]
    }

    fn prepare_adopted_batch(&mut self, adopted: AdoptedBatch) -> Vec<RecoverabilityEvent> {
        self.state = RetryState::Preparing;
        self.total_number_of_messages += adopted.number_of_messages;
        self.number_of_messages_prepared += adopted.number_of_messages;
        self.completion_time = None;
        self.originator = self.originator.take().or(adopted.originator);
        self.classifier = self.classifier.take().or(adopted.classifier);
        self.started = self.started.min(adopted.start_time);
        self.last = self.last.max(adopted.last);
        vec![self.preparing_event()]
    }

    fn forwarding(&mut self) -> Vec<RecoverabilityEvent> {
        self.state = RetryState::Forwarding;
        vec![self.forwarding_event()]
    }

    fn forwarded(&mut self, forwarded: usize) -> Vec<RecoverabilityEvent> {
        self.number_of_messages_forwarded += forwarded;
        let mut events = vec![self.forwarding_event()];
        events.extend(self.check_for_completion());
        events
    }

    fn skip(&mut self, skipped: usize) -> Vec<RecoverabilityEvent> {
        self.number_of_messages_skipped += skipped;
        self.check_for_completion()
    }

    fn check_for_completion(&mut self) -> Vec<RecoverabilityEvent> {
        if self.state == RetryState::Completed
            || self.number_of_messages_forwarded + self.number_of_messages_skipped
                != self.total_number_of_messages
        {
            return Vec::new();
        }

        let completed_at = Utc::now();
        self.state = RetryState::Completed;
        self.completion_time = Some(completed_at);

        let mut events = vec![RecoverabilityEvent::RetryOperationCompleted {
            request_id: self.request_id.clone(),
            retry_type: self.retry_type,
            failed: self.failed,
            progress: self.progress(),
            started_at: self.started,
            completed_at,
            originator: self.originator.clone(),
            classifier: self.classifier.clone(),
            last: self.last,
            number_of_messages_processed: self.number_of_messages_forwarded,
        }];

        // Failure-group retries report submitted messages once, at the end.
        if self.retry_type == RetryType::FailureGroup {
            events.push(RecoverabilityEvent::MessagesSubmittedForRetry {
                failed_message_ids: Vec::new(),
                number_of_failed_messages: self.number_of_messages_forwarded,
                context: self.originator.clone(),
            });
        }
        events
    }
}

/// Aggregate of the in-flight batches of one operation found at start-up.
#[derive(Debug, Clone, PartialEq)]
pub struct AdoptedBatch {
    pub number_of_messages: usize,
    pub originator: Option<String>,
    pub classifier: Option<String>,
    pub start_time: DateTime<Utc>,
    pub last: Option<DateTime<Utc>>,
}

/// Status query result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryOperationStatus {
    #[serde(flatten)]
    pub operation: InMemoryRetry,
    pub percentage: f64,
}

type OperationKey = (RequestId, RetryType);

/// Registry and state machine for retry operations.
///
/// Entry points take `Option<&RequestId>`: `None` marks a batch that predates
/// operation tracking and every call with it is silently ignored.
///
/// `wait`, `prepare`, `prepare_adopted_batch` and `fail` create the operation
/// on first reference; the remaining mutators require it to exist.
pub struct RetryingManager {
    operations: RwLock<HashMap<OperationKey, InMemoryRetry>>,
    events: Arc<dyn DomainEvents>,
}

impl RetryingManager {
    pub fn new(events: Arc<dyn DomainEvents>) -> Self {
        Self {
            operations: RwLock::new(HashMap::new()),
            events,
        }
    }

    fn update<F>(
        &self,
        request_id: Option<&RequestId>,
        retry_type: RetryType,
        create: bool,
        apply: F,
    ) -> Result<(), TrackerError>
    where
        F: FnOnce(&mut InMemoryRetry) -> Vec<RecoverabilityEvent>,
    {
        let Some(request_id) = request_id else {
            debug!(retry_type = %retry_type, "ignoring tracker call without request id");
            return Ok(());
        };

        let events = {
            let mut operations = self.operations.write().map_err(|_| TrackerError::Poisoned)?;
            let key = (request_id.clone(), retry_type);
            let operation = if create {
                operations
                    .entry(key)
                    .or_insert_with(|| InMemoryRetry::new(request_id.clone(), retry_type))
            } else {
                operations
                    .get_mut(&key)
                    .ok_or_else(|| TrackerError::UnknownOperation {
                        request_id: request_id.clone(),
                        retry_type,
                    })?
            };
            apply(operation)
        };

        for event in events {
            self.events.raise(event);
        }
        Ok(())
    }

    /// Reset the operation and enter Waiting.
    pub fn wait(
        &self,
        request_id: Option<&RequestId>,
        retry_type: RetryType,
        started: DateTime<Utc>,
        originator: Option<String>,
        classifier: Option<String>,
        last: Option<DateTime<Utc>>,
    ) -> Result<(), TrackerError> {
        self.update(request_id, retry_type, true, |op| {
            op.wait(started, originator, classifier, last)
        })
    }

    pub fn prepare(
        &self,
        request_id: Option<&RequestId>,
        retry_type: RetryType,
        total: usize,
    ) -> Result<(), TrackerError> {
        self.update(request_id, retry_type, true, |op| op.prepare(total))
    }

    /// Record the running count of prepared messages.
    pub fn prepare_batch(
        &self,
        request_id: Option<&RequestId>,
        retry_type: RetryType,
        prepared: usize,
    ) -> Result<(), TrackerError> {
        self.update(request_id, retry_type, false, |op| op.prepare_batch(prepared))
    }

    /// Account for in-flight batches found at start-up or adopted from a
    /// previous session. Sizes accumulate across calls.
    pub fn prepare_adopted_batch(
        &self,
        request_id: Option<&RequestId>,
        retry_type: RetryType,
        adopted: AdoptedBatch,
    ) -> Result<(), TrackerError> {
        self.update(request_id, retry_type, true, |op| op.prepare_adopted_batch(adopted))
    }

    pub fn forwarding(
        &self,
        request_id: Option<&RequestId>,
        retry_type: RetryType,
    ) -> Result<(), TrackerError> {
        self.update(request_id, retry_type, false, InMemoryRetry::forwarding)
    }

    pub fn forwarded(
        &self,
        request_id: Option<&RequestId>,
        retry_type: RetryType,
        forwarded: usize,
    ) -> Result<(), TrackerError> {
        self.update(request_id, retry_type, false, |op| op.forwarded(forwarded))
    }

    pub fn skip(
        &self,
        request_id: Option<&RequestId>,
        retry_type: RetryType,
        skipped: usize,
    ) -> Result<(), TrackerError> {
        self.update(request_id, retry_type, false, |op| op.skip(skipped))
    }

    /// Flag the operation failed without changing its state.
    pub fn fail(
        &self,
        request_id: Option<&RequestId>,
        retry_type: RetryType,
    ) -> Result<(), TrackerError> {
        self.update(request_id, retry_type, true, |op| {
            op.failed = true;
            Vec::new()
        })
    }

    pub fn is_operation_in_progress(&self, request_id: &RequestId, retry_type: RetryType) -> bool {
        self.operations
            .read()
            .ok()
            .and_then(|ops| ops.get(&(request_id.clone(), retry_type)).map(InMemoryRetry::is_in_progress))
            .unwrap_or(false)
    }

    /// Snapshot of one operation; `None` if it was never requested.
    pub fn status(&self, request_id: &RequestId, retry_type: RetryType) -> Option<RetryOperationStatus> {
        let operations = self.operations.read().ok()?;
        let operation = operations.get(&(request_id.clone(), retry_type))?.clone();
        let percentage = operation.percentage();
        Some(RetryOperationStatus { operation, percentage })
    }

    /// Every known operation, oldest first.
    pub fn operations(&self) -> Vec<InMemoryRetry> {
        let Ok(operations) = self.operations.read() else {
            return Vec::new();
        };
        let mut all: Vec<_> = operations.values().cloned().collect();
        all.sort_by_key(|op| op.started);
        all
    }
}

impl std::fmt::Debug for RetryingManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.operations.read().map(|ops| ops.len()).unwrap_or(0);
        f.debug_struct("RetryingManager")
            .field("operations", &count)
            .finish()
    }
}
