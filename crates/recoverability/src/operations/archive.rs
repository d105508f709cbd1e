//! In-memory progress of archive operations.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;

use busmon_core::{ArchiveState, ArchiveType, RequestId, archive_percentage};
use busmon_events::{ArchiveProgress, DomainEvents, RecoverabilityEvent};

use crate::error::TrackerError;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArchiveOperation {
    pub request_id: RequestId,
    pub archive_type: ArchiveType,
    pub state: ArchiveState,
    pub total_number_of_messages: usize,
    pub number_of_messages_archived: usize,
    pub number_of_batches: usize,
    pub current_batch: usize,
    pub started: DateTime<Utc>,
    pub last: Option<DateTime<Utc>>,
    pub completion_time: Option<DateTime<Utc>>,
}

impl ArchiveOperation {
    pub fn percentage(&self) -> f64 {
        archive_percentage(self.total_number_of_messages, self.number_of_messages_archived, self.state)
    }

    pub fn progress(&self) -> ArchiveProgress {
        ArchiveProgress {
            state: self.state,
            total: self.total_number_of_messages,
            archived: self.number_of_messages_archived,
            number_of_batches: self.number_of_batches,
            current_batch: self.current_batch,
            percentage: self.percentage(),
        }
    }

    fn event(&self) -> RecoverabilityEvent {
        let (request_id, archive_type, progress, started_at) = (
            self.request_id.clone(),
            self.archive_type,
            self.progress(),
            self.started,
        );
        match self.state {
            ArchiveState::ArchiveStarted => RecoverabilityEvent::ArchiveOperationStarting {
                request_id,
                archive_type,
                progress,
                started_at,
            },
            ArchiveState::ArchiveProgressing => RecoverabilityEvent::ArchiveOperationBatchCompleted {
                request_id,
                archive_type,
                progress,
                started_at,
            },
            ArchiveState::ArchiveFinalizing => RecoverabilityEvent::ArchiveOperationFinalizing {
                request_id,
                archive_type,
                progress,
                started_at,
            },
            ArchiveState::ArchiveCompleted => RecoverabilityEvent::ArchiveOperationCompleted {
                request_id,
                archive_type,
                progress,
                started_at,
                completed_at: self.completion_time.unwrap_or_else(Utc::now),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArchiveOperationStatus {
    #[serde(flatten)]
    pub operation: ArchiveOperation,
    pub percentage: f64,
}

/// Registry for archive operations.
///
/// Completed operations stay visible until dismissed.
pub struct ArchivingManager {
    operations: RwLock<HashMap<(RequestId, ArchiveType), ArchiveOperation>>,
    events: Arc<dyn DomainEvents>,
}

impl ArchivingManager {
    pub fn new(events: Arc<dyn DomainEvents>) -> Self {
        Self {
            operations: RwLock::new(HashMap::new()),
            events,
        }
    }

    fn transition<F>(
        &self,
        request_id: &RequestId,
        archive_type: ArchiveType,
        apply: F,
    ) -> Result<(), TrackerError>
    where
        F: FnOnce(&mut ArchiveOperation),
    {
        let event = {
            let mut operations = self.operations.write().map_err(|_| TrackerError::Poisoned)?;
            let operation = operations
                .get_mut(&(request_id.clone(), archive_type))
                .ok_or_else(|| TrackerError::UnknownArchive {
                    request_id: request_id.clone(),
                    archive_type,
                })?;
            apply(operation);
            operation.event()
        };
        self.events.raise(event);
        Ok(())
    }

    /// Start (or restart) an operation sized at `total` messages in
    /// `number_of_batches` batches.
    pub fn start(
        &self,
        request_id: &RequestId,
        archive_type: ArchiveType,
        total: usize,
        number_of_batches: usize,
    ) -> Result<(), TrackerError> {
        let operation = ArchiveOperation {
            request_id: request_id.clone(),
            archive_type,
            state: ArchiveState::ArchiveStarted,
            total_number_of_messages: total,
            number_of_messages_archived: 0,
            number_of_batches,
            current_batch: 0,
            started: Utc::now(),
            last: None,
            completion_time: None,
        };
        let event = operation.event();
        self.operations
            .write()
            .map_err(|_| TrackerError::Poisoned)?
            .insert((request_id.clone(), archive_type), operation);
        self.events.raise(event);
        Ok(())
    }

    pub fn batch_archived(
        &self,
        request_id: &RequestId,
        archive_type: ArchiveType,
        archived: usize,
    ) -> Result<(), TrackerError> {
        self.transition(request_id, archive_type, |op| {
            op.state = ArchiveState::ArchiveProgressing;
            op.number_of_messages_archived += archived;
            op.current_batch += 1;
            op.last = Some(Utc::now());
        })
    }

    pub fn finalizing(&self, request_id: &RequestId, archive_type: ArchiveType) -> Result<(), TrackerError> {
        self.transition(request_id, archive_type, |op| {
            op.state = ArchiveState::ArchiveFinalizing;
        })
    }

    pub fn complete(&self, request_id: &RequestId, archive_type: ArchiveType) -> Result<(), TrackerError> {
        self.transition(request_id, archive_type, |op| {
            op.state = ArchiveState::ArchiveCompleted;
            op.completion_time = Some(Utc::now());
        })
    }

    /// Forget an operation. Returns false if it was unknown.
    pub fn dismiss(&self, request_id: &RequestId, archive_type: ArchiveType) -> bool {
        self.operations
            .write()
            .map(|mut ops| ops.remove(&(request_id.clone(), archive_type)).is_some())
            .unwrap_or(false)
    }

    pub fn is_operation_in_progress(&self, request_id: &RequestId, archive_type: ArchiveType) -> bool {
        self.operations
            .read()
            .ok()
            .and_then(|ops| {
                ops.get(&(request_id.clone(), archive_type))
                    .map(|op| !op.state.is_terminal())
            })
            .unwrap_or(false)
    }

    pub fn status(&self, request_id: &RequestId, archive_type: ArchiveType) -> Option<ArchiveOperationStatus> {
        let operations = self.operations.read().ok()?;
        let operation = operations.get(&(request_id.clone(), archive_type))?.clone();
        let percentage = operation.percentage();
        Some(ArchiveOperationStatus { operation, percentage })
    }

    pub fn operations(&self) -> Vec<ArchiveOperation> {
        let Ok(operations) = self.operations.read() else {
            return Vec::new();
        };
        let mut all: Vec<_> = operations.values().cloned().collect();
        all.sort_by_key(|op| op.started);
        all
    }
}

impl std::fmt::Debug for ArchivingManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.operations.read().map(|ops| ops.len()).unwrap_or(0);
        f.debug_struct("ArchivingManager")
            .field("operations", &count)
            .finish()
    }
}
