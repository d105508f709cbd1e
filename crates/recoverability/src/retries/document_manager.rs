//! Crash recovery for retry batches.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use busmon_core::{RetryType, SessionId};

use super::log_tracker_error;
use crate::error::RecoverabilityResult;
use crate::operations::{AdoptedBatch, RetryingManager};
use crate::scheduler::CancellationSignal;
use crate::store::BatchStore;

/// Adopts batches abandoned by earlier sessions and rebuilds tracker state
/// after a restart.
pub struct RetryDocumentManager {
    store: Arc<dyn BatchStore>,
    tracker: Arc<RetryingManager>,
    session_id: SessionId,
}

impl RetryDocumentManager {
    pub fn new(
        store: Arc<dyn BatchStore>,
        tracker: Arc<RetryingManager>,
        session_id: SessionId,
    ) -> Self {
        Self {
            store,
            tracker,
            session_id,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Move batches left in MarkingDocuments by another session (created
    /// before `cutoff`) straight to Staging under this session.
    ///
    /// Operations other than message selections are flagged failed: their
    /// sizing can no longer be trusted, although every adopted message is
    /// still retried. Returns true when the caller should poll again.
    pub async fn adopt_orphaned_batches(
        &self,
        cutoff: DateTime<Utc>,
        cancel: &CancellationSignal,
    ) -> RecoverabilityResult<bool> {
        let orphaned = self.store.query_orphaned(self.session_id, cutoff).await?;
        let needs_more_polling = orphaned.is_stale || !orphaned.results.is_empty();

        if orphaned.results.is_empty() {
            debug!(stale = orphaned.is_stale, "no orphaned retry batches");
            return Ok(needs_more_polling);
        }

        let ids: Vec<_> = orphaned.results.iter().map(|b| b.id).collect();
        let adopted = self.store.adopt_batches(&ids, self.session_id).await?;

        if cancel.is_cancelled() {
            return Ok(needs_more_polling);
        }

        for batch in &adopted {
            info!(
                batch_id = %batch.id,
                request_id = ?batch.request_id,
                retry_type = %batch.retry_type,
                size = batch.initial_batch_size,
                "adopted orphaned retry batch"
            );

            log_tracker_error(self.tracker.prepare_adopted_batch(
                batch.request_id.as_ref(),
                batch.retry_type,
                AdoptedBatch {
                    number_of_messages: batch.initial_batch_size,
                    originator: batch.originator.clone(),
                    classifier: batch.classifier.clone(),
                    start_time: batch.start_time,
                    last: batch.last,
                },
            ));
            if batch.retry_type != RetryType::MultipleMessages {
                log_tracker_error(self.tracker.fail(batch.request_id.as_ref(), batch.retry_type));
            }
        }

        Ok(needs_more_polling)
    }

    /// Replay batches still in Staging or Forwarding into the tracker.
    pub async fn rebuild_retry_operation_state(&self) -> RecoverabilityResult<()> {
        let groups = self.store.batch_groups().await?;

        for group in &groups {
            debug!(
                request_id = ?group.request_id,
                retry_type = %group.retry_type,
                size = group.initial_batch_size,
                staging = group.has_staging_batches,
                forwarding = group.has_forwarding_batches,
                "rebuilding retry operation"
            );
            log_tracker_error(self.tracker.prepare_adopted_batch(
                group.request_id.as_ref(),
                group.retry_type,
                AdoptedBatch {
                    number_of_messages: group.initial_batch_size,
                    originator: group.originator.clone(),
                    classifier: group.classifier.clone(),
                    start_time: group.start_time,
                    last: group.last,
                },
            ));
        }

        info!(operations = groups.len(), "retry operation state rebuilt");
        Ok(())
    }
}

impl std::fmt::Debug for RetryDocumentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryDocumentManager")
            .field("session_id", &self.session_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::documents::{RetryBatch, RetryBatchStatus};
    use crate::store::InMemoryBatchStore;
    use busmon_core::{FailedMessageId, FailedMessageRetryId, RequestId, RetryState, StagingId};
    use busmon_events::{InMemoryEventBus, Notification};

    fn tracker() -> Arc<RetryingManager> {
        Arc::new(RetryingManager::new(Arc::new(InMemoryEventBus::<Notification>::new())))
    }

    async fn orphan(
        store: &InMemoryBatchStore,
        session: SessionId,
        request: &str,
        retry_type: RetryType,
        size: usize,
    ) -> busmon_core::RetryBatchId {
        let messages: Vec<_> = (0..size)
            .map(|i| FailedMessageId::new(format!("{request}-{i}")).unwrap())
            .collect();
        let batch = RetryBatch::new(
            session,
            Some(RequestId::new(request).unwrap()),
            retry_type,
            messages.iter().map(FailedMessageRetryId::for_message).collect(),
            Utc::now(),
        );
        let id = store.create_batch(batch).await.unwrap();
        store.link_members(id, &messages).await.unwrap();
        id
    }

    #[tokio::test]
    async fn adopts_orphans_and_flags_their_operations() {
        let store = InMemoryBatchStore::arc();
        let tracker = tracker();
        let previous = SessionId::new();
        let endpoint = orphan(&store, previous, "Sales", RetryType::AllForEndpoint, 3).await;
        let selection = orphan(&store, previous, "sel-1", RetryType::MultipleMessages, 2).await;

        let manager = RetryDocumentManager::new(store.clone(), tracker.clone(), SessionId::new());
        let cutoff = Utc::now() + chrono::Duration::seconds(1);

        assert!(manager.adopt_orphaned_batches(cutoff, &CancellationSignal::never()).await.unwrap());
        assert!(!manager.adopt_orphaned_batches(cutoff, &CancellationSignal::never()).await.unwrap());

        for id in [endpoint, selection] {
            let batch = store.get_batch(id).await.unwrap().unwrap();
            assert_eq!(batch.status, RetryBatchStatus::Staging);
            assert_eq!(batch.session_id, manager.session_id());
        }

        let sales = tracker
            .status(&RequestId::new("Sales").unwrap(), RetryType::AllForEndpoint)
            .unwrap();
        assert!(sales.operation.failed);
        assert_eq!(sales.operation.total_number_of_messages, 3);

        let sel = tracker
            .status(&RequestId::new("sel-1").unwrap(), RetryType::MultipleMessages)
            .unwrap();
        assert!(!sel.operation.failed);
    }

    #[tokio::test]
    async fn own_session_batches_are_not_orphans() {
        let store = InMemoryBatchStore::arc();
        let session = SessionId::new();
        let id = orphan(&store, session, "Sales", RetryType::AllForEndpoint, 1).await;

        let manager = RetryDocumentManager::new(store.clone(), tracker(), session);
        let adopted = manager
            .adopt_orphaned_batches(Utc::now() + chrono::Duration::seconds(1), &CancellationSignal::never())
            .await
            .unwrap();

        assert!(!adopted);
        let batch = store.get_batch(id).await.unwrap().unwrap();
        assert_eq!(batch.status, RetryBatchStatus::MarkingDocuments);
    }

    #[tokio::test]
    async fn rebuild_restores_in_flight_operations() {
        let store = InMemoryBatchStore::arc();
        let session = SessionId::new();
        let a = orphan(&store, session, "Sales", RetryType::AllForEndpoint, 4).await;
        let b = orphan(&store, session, "Sales", RetryType::AllForEndpoint, 2).await;
        orphan(&store, session, "Billing", RetryType::AllForEndpoint, 7).await;
        store.move_to_staging(a).await.unwrap();
        store.move_to_staging(b).await.unwrap();
        let b_members = store.get_batch(b).await.unwrap().unwrap().failure_retries;
        store.move_to_forwarding(b, StagingId::new(), b_members).await.unwrap();

        let tracker = tracker();
        RetryDocumentManager::new(store.clone(), tracker.clone(), session)
            .rebuild_retry_operation_state()
            .await
            .unwrap();

        let sales = tracker
            .status(&RequestId::new("Sales").unwrap(), RetryType::AllForEndpoint)
            .unwrap();
        assert_eq!(sales.operation.state, RetryState::Preparing);
        assert_eq!(sales.operation.total_number_of_messages, 6);
        assert!(tracker.status(&RequestId::new("Billing").unwrap(), RetryType::AllForEndpoint).is_none());
    }
}
