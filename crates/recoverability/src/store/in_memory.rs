//! In-memory batch store for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use busmon_core::{
    FailedMessageId, FailedMessageRetryId, RequestId, RetryBatchId, RetryType, SessionId,
    StagingId,
};

use super::batch_store::{BatchStore, QueryResult, SessionFilter, StoreError};
use crate::documents::{
    FailedMessageRetry, RetryBatch, RetryBatchGroup, RetryBatchNowForwarding, RetryBatchStatus,
};

/// Store operations that can be made to fail with [`InMemoryBatchStore::fail_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOperation {
    MoveToForwarding,
    DeleteForwardingMarker,
}

#[derive(Debug, Default)]
struct Documents {
    batches: HashMap<RetryBatchId, RetryBatch>,
    retries: HashMap<FailedMessageRetryId, FailedMessageRetry>,
    now_forwarding: Option<RetryBatchNowForwarding>,
    // Remaining injected failures per operation.
    faults: HashMap<StoreOperation, u32>,
}

impl Documents {
    fn injected_fault(&mut self, operation: StoreOperation) -> Result<(), StoreError> {
        match self.faults.get_mut(&operation) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(StoreError::Storage(format!("injected fault in {operation:?}")))
            }
            _ => Ok(()),
        }
    }
}

/// In-memory batch store.
///
/// One lock guards every document so that multi-document operations
/// (adoption, marker release) are atomic.
#[derive(Debug, Default)]
pub struct InMemoryBatchStore {
    docs: Mutex<Documents>,
}

impl InMemoryBatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn docs(&self) -> Result<MutexGuard<'_, Documents>, StoreError> {
        self.docs.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Every batch, oldest first.
    pub fn batches(&self) -> Vec<RetryBatch> {
        let Ok(docs) = self.docs() else {
            return Vec::new();
        };
        let mut batches: Vec<_> = docs.batches.values().cloned().collect();
        batches.sort_by_key(|b| b.created_at);
        batches
    }

    pub fn failure_retry(&self, id: FailedMessageRetryId) -> Option<FailedMessageRetry> {
        self.docs().ok()?.retries.get(&id).cloned()
    }

    pub fn failure_retry_count(&self) -> usize {
        self.docs().map(|d| d.retries.len()).unwrap_or(0)
    }

    /// Make the next `times` calls of `operation` fail.
    pub fn fail_next(&self, operation: StoreOperation, times: u32) {
        if let Ok(mut docs) = self.docs() {
            docs.faults.insert(operation, times);
        }
    }
}

fn oldest_first(mut batches: Vec<RetryBatch>) -> Vec<RetryBatch> {
    batches.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    batches
}

#[async_trait::async_trait]
impl BatchStore for InMemoryBatchStore {
    async fn create_batch(&self, batch: RetryBatch) -> Result<RetryBatchId, StoreError> {
        let mut docs = self.docs()?;
        if docs.batches.contains_key(&batch.id) {
            return Err(StoreError::AlreadyExists(batch.id.to_string()));
        }
        let id = batch.id;
        docs.batches.insert(id, batch);
        Ok(id)
    }

    async fn get_batch(&self, batch_id: RetryBatchId) -> Result<Option<RetryBatch>, StoreError> {
        Ok(self.docs()?.batches.get(&batch_id).cloned())
    }

    async fn link_members(
        &self,
        batch_id: RetryBatchId,
        messages: &[FailedMessageId],
    ) -> Result<(), StoreError> {
        let mut docs = self.docs()?;
        if !docs.batches.contains_key(&batch_id) {
            return Err(StoreError::BatchNotFound(batch_id));
        }
        for message in messages {
            let marker = FailedMessageRetry::new(message.clone(), batch_id);
            docs.retries
                .entry(marker.id)
                .and_modify(|existing| existing.retry_batch_id = batch_id)
                .or_insert(marker);
        }
        Ok(())
    }

    async fn move_to_staging(&self, batch_id: RetryBatchId) -> Result<(), StoreError> {
        let mut docs = self.docs()?;
        let batch = docs
            .batches
            .get_mut(&batch_id)
            .ok_or(StoreError::BatchNotFound(batch_id))?;
        batch.mark_staging()?;
        Ok(())
    }

    async fn move_to_forwarding(
        &self,
        batch_id: RetryBatchId,
        staging_id: StagingId,
        staged: Vec<FailedMessageRetryId>,
    ) -> Result<(), StoreError> {
        let mut docs = self.docs()?;
        docs.injected_fault(StoreOperation::MoveToForwarding)?;
        let batch = docs
            .batches
            .get_mut(&batch_id)
            .ok_or(StoreError::BatchNotFound(batch_id))?;
        batch.mark_forwarding(staging_id, staged)?;
        Ok(())
    }

    async fn delete_batch(&self, batch_id: RetryBatchId) -> Result<bool, StoreError> {
        Ok(self.docs()?.batches.remove(&batch_id).is_some())
    }

    async fn query_by_status(
        &self,
        status: RetryBatchStatus,
        sessions: SessionFilter,
    ) -> Result<Vec<RetryBatch>, StoreError> {
        let docs = self.docs()?;
        let matching = docs
            .batches
            .values()
            .filter(|b| b.status == status && sessions.accepts(b.session_id))
            .cloned()
            .collect();
        Ok(oldest_first(matching))
    }

    async fn query_orphaned(
        &self,
        current_session: SessionId,
        cutoff: DateTime<Utc>,
    ) -> Result<QueryResult<RetryBatch>, StoreError> {
        let docs = self.docs()?;
        let orphaned = docs
            .batches
            .values()
            .filter(|b| {
                b.status == RetryBatchStatus::MarkingDocuments
                    && SessionFilter::Except(current_session).accepts(b.session_id)
                    && b.created_at < cutoff
            })
            .cloned()
            .collect();
        Ok(QueryResult {
            results: oldest_first(orphaned),
            is_stale: false,
        })
    }

    async fn adopt_batches(
        &self,
        batch_ids: &[RetryBatchId],
        session: SessionId,
    ) -> Result<Vec<RetryBatch>, StoreError> {
        let mut docs = self.docs()?;
        let mut adopted = Vec::with_capacity(batch_ids.len());
        for id in batch_ids {
            let Some(batch) = docs.batches.get_mut(id) else {
                continue;
            };
            if batch.status != RetryBatchStatus::MarkingDocuments {
                continue;
            }
            batch.adopt(session)?;
            adopted.push(batch.clone());
        }
        Ok(adopted)
    }

    async fn batch_groups(&self) -> Result<Vec<RetryBatchGroup>, StoreError> {
        let docs = self.docs()?;
        let mut groups: HashMap<(Option<RequestId>, RetryType), RetryBatchGroup> = HashMap::new();

        for batch in docs.batches.values() {
            let staging = batch.status == RetryBatchStatus::Staging;
            let forwarding = batch.status == RetryBatchStatus::Forwarding;
            if !staging && !forwarding {
                continue;
            }
            let group = groups
                .entry((batch.request_id.clone(), batch.retry_type))
                .or_insert_with(|| RetryBatchGroup {
                    request_id: batch.request_id.clone(),
                    retry_type: batch.retry_type,
                    has_staging_batches: false,
                    has_forwarding_batches: false,
                    initial_batch_size: 0,
                    originator: batch.originator.clone(),
                    classifier: batch.classifier.clone(),
                    start_time: batch.start_time,
                    last: batch.last,
                });
            group.has_staging_batches |= staging;
            group.has_forwarding_batches |= forwarding;
            group.initial_batch_size += if staging {
                batch.initial_batch_size
            } else {
                batch.failure_retries.len()
            };
            group.start_time = group.start_time.min(batch.start_time);
            group.last = group.last.max(batch.last);
        }

        let mut groups: Vec<_> = groups.into_values().collect();
        groups.sort_by_key(|g| g.start_time);
        Ok(groups)
    }

    async fn load_failure_retries(
        &self,
        ids: &[FailedMessageRetryId],
    ) -> Result<Vec<FailedMessageRetry>, StoreError> {
        let docs = self.docs()?;
        Ok(ids.iter().filter_map(|id| docs.retries.get(id).cloned()).collect())
    }

    async fn increment_stage_attempts(&self, id: FailedMessageRetryId) -> Result<u32, StoreError> {
        let mut docs = self.docs()?;
        let marker = docs.retries.get_mut(&id).ok_or(StoreError::RetryNotFound(id))?;
        marker.stage_attempts += 1;
        Ok(marker.stage_attempts)
    }

    async fn delete_failure_retry(&self, id: FailedMessageRetryId) -> Result<(), StoreError> {
        self.docs()?.retries.remove(&id);
        Ok(())
    }

    async fn release_failure_retries(
        &self,
        batch_id: RetryBatchId,
        ids: &[FailedMessageRetryId],
    ) -> Result<usize, StoreError> {
        let mut docs = self.docs()?;
        let mut released = 0;
        for id in ids {
            if docs.retries.get(id).is_some_and(|r| r.is_claimed_by(batch_id)) {
                docs.retries.remove(id);
                released += 1;
            }
        }
        Ok(released)
    }

    async fn insert_forwarding_marker(
        &self,
        marker: RetryBatchNowForwarding,
    ) -> Result<bool, StoreError> {
        let mut docs = self.docs()?;
        if docs.now_forwarding.is_some() {
            return Ok(false);
        }
        docs.now_forwarding = Some(marker);
        Ok(true)
    }

    async fn forwarding_marker(&self) -> Result<Option<RetryBatchNowForwarding>, StoreError> {
        Ok(self.docs()?.now_forwarding)
    }

    async fn delete_forwarding_marker(&self, batch_id: RetryBatchId) -> Result<bool, StoreError> {
        let mut docs = self.docs()?;
        docs.injected_fault(StoreOperation::DeleteForwardingMarker)?;
        match docs.now_forwarding {
            Some(marker) if marker.retry_batch_id == batch_id => {
                docs.now_forwarding = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
