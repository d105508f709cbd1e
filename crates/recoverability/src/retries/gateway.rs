//! Entry point for retry requests.
//!
//! Single-message and selection retries are staged synchronously. Bulk
//! retries are queued and expanded into batches by [`RetriesGateway::process_next_bulk_retry`],
//! which the host drives from a timer job.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tracing::{debug, info};

use busmon_core::{FailedMessageId, FailedMessageRetryId, RequestId, RetryType, SessionId};

use super::log_tracker_error;
use crate::documents::RetryBatch;
use crate::error::{RecoverabilityResult, StoreError};
use crate::failed_message::FailedMessageFilter;
use crate::operations::RetryingManager;
use crate::store::{BatchStore, FailedMessageStore};

/// Maximum number of messages per retry batch.
pub const BATCH_SIZE: usize = 1000;

/// Selection a bulk retry expands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkRetryScope {
    All,
    Endpoint(String),
    FailureGroup(String),
    QueueAddress(String),
}

impl BulkRetryScope {
    pub fn retry_type(&self) -> RetryType {
        match self {
            BulkRetryScope::All => RetryType::All,
            BulkRetryScope::Endpoint(_) => RetryType::AllForEndpoint,
            BulkRetryScope::FailureGroup(_) => RetryType::FailureGroup,
            BulkRetryScope::QueueAddress(_) => RetryType::ByQueueAddress,
        }
    }

    pub fn filter(&self) -> FailedMessageFilter {
        match self {
            BulkRetryScope::All => FailedMessageFilter::All,
            BulkRetryScope::Endpoint(endpoint) => FailedMessageFilter::Endpoint(endpoint.clone()),
            BulkRetryScope::FailureGroup(group) => FailedMessageFilter::FailureGroup(group.clone()),
            BulkRetryScope::QueueAddress(address) => {
                FailedMessageFilter::QueueAddress(address.clone())
            }
        }
    }
}

/// A queued bulk retry.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkRetryRequest {
    pub request_id: RequestId,
    pub scope: BulkRetryScope,
    pub originator: Option<String>,
    pub classifier: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl BulkRetryRequest {
    pub fn retry_type(&self) -> RetryType {
        self.scope.retry_type()
    }
}

/// Ids of one bulk enumeration, chunked into batches.
#[derive(Debug, Default)]
struct Enumerated {
    chunks: Vec<Vec<FailedMessageId>>,
    latest_failure: Option<DateTime<Utc>>,
}

impl Enumerated {
    fn total(&self) -> usize {
        self.chunks.iter().map(Vec::len).sum()
    }
}

/// Human-readable batch originator: `'<context>' batch i of n`.
pub fn batch_name(page: usize, pages: usize, context: Option<&str>) -> Option<String> {
    context.map(|c| format!("'{c}' batch {page} of {pages}"))
}

/// Retry request gateway.
pub struct RetriesGateway {
    store: Arc<dyn BatchStore>,
    messages: Arc<dyn FailedMessageStore>,
    tracker: Arc<RetryingManager>,
    session_id: SessionId,
    bulk_requests: Mutex<VecDeque<BulkRetryRequest>>,
    // Single consumer for the bulk queue.
    bulk_consumer: tokio::sync::Mutex<()>,
}

impl RetriesGateway {
    pub fn new(
        store: Arc<dyn BatchStore>,
        messages: Arc<dyn FailedMessageStore>,
        tracker: Arc<RetryingManager>,
        session_id: SessionId,
    ) -> Self {
        Self {
            store,
            messages,
            tracker,
            session_id,
            bulk_requests: Mutex::new(VecDeque::new()),
            bulk_consumer: tokio::sync::Mutex::new(()),
        }
    }

    pub fn pending_bulk_requests(&self) -> usize {
        self.bulk_requests.lock().map(|q| q.len()).unwrap_or(0)
    }

    pub async fn start_retry_for_single_message(
        &self,
        message_id: FailedMessageId,
    ) -> RecoverabilityResult<()> {
        let request_id = RequestId::new(message_id.as_str())?;
        let retry_type = RetryType::SingleMessage;
        let started = Utc::now();

        log_tracker_error(self.tracker.prepare(Some(&request_id), retry_type, 1));
        self.stage_retry_by_unique_message_ids(
            &request_id,
            retry_type,
            &[message_id],
            started,
            None,
            None,
            None,
        )
        .await?;
        log_tracker_error(self.tracker.prepare_batch(Some(&request_id), retry_type, 1));
        Ok(())
    }

    /// Retry an explicit selection. Returns the generated request id.
    pub async fn start_retry_for_message_selection(
        &self,
        message_ids: Vec<FailedMessageId>,
    ) -> RecoverabilityResult<RequestId> {
        let request_id = RequestId::generate();
        let retry_type = RetryType::MultipleMessages;
        let started = Utc::now();

        let mut seen = HashSet::with_capacity(message_ids.len());
        let unique: Vec<_> = message_ids
            .into_iter()
            .filter(|id| seen.insert(id.normalized()))
            .collect();
        if unique.is_empty() {
            return Ok(request_id);
        }

        log_tracker_error(self.tracker.prepare(Some(&request_id), retry_type, unique.len()));
        let mut prepared = 0;
        for chunk in unique.chunks(BATCH_SIZE) {
            self.stage_retry_by_unique_message_ids(
                &request_id,
                retry_type,
                chunk,
                started,
                None,
                None,
                None,
            )
            .await?;
            prepared += chunk.len();
            log_tracker_error(self.tracker.prepare_batch(Some(&request_id), retry_type, prepared));
        }
        Ok(request_id)
    }

    pub fn start_retry_for_all_messages(&self) -> RecoverabilityResult<()> {
        self.enqueue(BulkRetryRequest {
            request_id: RequestId::new("All")?,
            scope: BulkRetryScope::All,
            originator: Some("all messages".to_string()),
            classifier: None,
            started_at: Utc::now(),
        })
    }

    pub fn start_retry_for_endpoint(&self, endpoint: &str) -> RecoverabilityResult<()> {
        self.enqueue(BulkRetryRequest {
            request_id: RequestId::new(endpoint)?,
            scope: BulkRetryScope::Endpoint(endpoint.to_string()),
            originator: Some(endpoint.to_string()),
            classifier: None,
            started_at: Utc::now(),
        })
    }

    pub fn start_retry_for_failed_queue_address(&self, address: &str) -> RecoverabilityResult<()> {
        self.enqueue(BulkRetryRequest {
            request_id: RequestId::new(address)?,
            scope: BulkRetryScope::QueueAddress(address.to_string()),
            originator: Some(address.to_string()),
            classifier: None,
            started_at: Utc::now(),
        })
    }

    /// `context` is the group title, `classifier` the grouping strategy.
    pub fn enqueue_retry_for_failure_group(
        &self,
        group_id: &str,
        context: Option<String>,
        classifier: Option<String>,
        started_at: DateTime<Utc>,
    ) -> RecoverabilityResult<()> {
        self.enqueue(BulkRetryRequest {
            request_id: RequestId::new(group_id)?,
            scope: BulkRetryScope::FailureGroup(group_id.to_string()),
            originator: context,
            classifier,
            started_at,
        })
    }

    fn enqueue(&self, request: BulkRetryRequest) -> RecoverabilityResult<()> {
        if self
            .tracker
            .is_operation_in_progress(&request.request_id, request.retry_type())
        {
            info!(
                request_id = %request.request_id,
                retry_type = %request.retry_type(),
                "retry operation already in progress; request ignored"
            );
            return Ok(());
        }

        log_tracker_error(self.tracker.wait(
            Some(&request.request_id),
            request.retry_type(),
            request.started_at,
            request.originator.clone(),
            request.classifier.clone(),
            None,
        ));

        info!(
            request_id = %request.request_id,
            retry_type = %request.retry_type(),
            "bulk retry enqueued"
        );
        self.bulk_requests
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .push_back(request);
        Ok(())
    }

    /// Expand the oldest queued bulk request into batches. Returns false if
    /// the queue was empty.
    pub async fn process_next_bulk_retry(&self) -> RecoverabilityResult<bool> {
        let _consumer = self.bulk_consumer.lock().await;

        let request = self
            .bulk_requests
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .pop_front();
        let Some(request) = request else {
            return Ok(false);
        };

        self.process_request(&request).await?;
        Ok(true)
    }

    async fn process_request(&self, request: &BulkRetryRequest) -> RecoverabilityResult<()> {
        let retry_type = request.retry_type();
        let enumerated = self.enumerate(&request.scope).await?;
        let total = enumerated.total();

        if self.tracker.is_operation_in_progress(&request.request_id, retry_type) {
            info!(request_id = %request.request_id, retry_type = %retry_type, "retry operation already in progress; skipping");
            return Ok(());
        }
        if total == 0 {
            info!(request_id = %request.request_id, retry_type = %retry_type, "no messages match bulk retry");
            return Ok(());
        }

        log_tracker_error(self.tracker.prepare(Some(&request.request_id), retry_type, total));

        let pages = enumerated.chunks.len();
        let mut prepared = 0;
        for (i, chunk) in enumerated.chunks.iter().enumerate() {
            self.stage_retry_by_unique_message_ids(
                &request.request_id,
                retry_type,
                chunk,
                request.started_at,
                enumerated.latest_failure,
                batch_name(i + 1, pages, request.originator.as_deref()),
                request.classifier.clone(),
            )
            .await?;
            prepared += chunk.len();
            log_tracker_error(self.tracker.prepare_batch(
                Some(&request.request_id),
                retry_type,
                prepared,
            ));
        }

        info!(
            request_id = %request.request_id,
            retry_type = %retry_type,
            total,
            batches = pages,
            "bulk retry prepared"
        );
        Ok(())
    }

    async fn enumerate(&self, scope: &BulkRetryScope) -> RecoverabilityResult<Enumerated> {
        let mut result = Enumerated::default();
        let mut current: Vec<FailedMessageId> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        let mut matches = self.messages.stream_matching(scope.filter());
        while let Some(matched) = matches.next().await {
            let matched = matched?;
            result.latest_failure = result.latest_failure.max(Some(matched.time_of_failure));

            if seen.insert(matched.id.normalized()) {
                current.push(matched.id);
            }
            if current.len() == BATCH_SIZE {
                result.chunks.push(std::mem::take(&mut current));
                seen.clear();
            }
        }
        if !current.is_empty() {
            result.chunks.push(current);
        }

        debug!(chunks = result.chunks.len(), total = result.total(), "bulk retry enumerated");
        Ok(result)
    }

    /// Create one batch for `message_ids`, link its members and hand it to
    /// the processor.
    #[allow(clippy::too_many_arguments)]
    async fn stage_retry_by_unique_message_ids(
        &self,
        request_id: &RequestId,
        retry_type: RetryType,
        message_ids: &[FailedMessageId],
        started: DateTime<Utc>,
        last: Option<DateTime<Utc>>,
        originator: Option<String>,
        classifier: Option<String>,
    ) -> RecoverabilityResult<()> {
        if message_ids.is_empty() {
            return Ok(());
        }

        let batch = RetryBatch::new(
            self.session_id,
            Some(request_id.clone()),
            retry_type,
            message_ids.iter().map(FailedMessageRetryId::for_message).collect(),
            started,
        )
        .with_originator(originator)
        .with_classifier(classifier)
        .with_last(last);

        let batch_id = self.store.create_batch(batch).await?;
        self.store.link_members(batch_id, message_ids).await?;
        self.store.move_to_staging(batch_id).await?;

        info!(
            batch_id = %batch_id,
            request_id = %request_id,
            retry_type = %retry_type,
            size = message_ids.len(),
            "retry batch created"
        );
        Ok(())
    }
}

impl std::fmt::Debug for RetriesGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetriesGateway")
            .field("session_id", &self.session_id)
            .field("pending_bulk_requests", &self.pending_bulk_requests())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::documents::RetryBatchStatus;
    use crate::failed_message::{
        ExceptionDetails, FailedMessage, FailedMessageStatus, FailureDetails, FailureGroup,
        Headers, ProcessingAttempt,
    };
    use crate::store::{InMemoryBatchStore, InMemoryFailedMessageStore};
    use busmon_core::RetryState;
    use busmon_events::{InMemoryEventBus, Notification};

    struct Fixture {
        store: Arc<InMemoryBatchStore>,
        messages: Arc<InMemoryFailedMessageStore>,
        tracker: Arc<RetryingManager>,
        gateway: RetriesGateway,
    }

    fn fixture() -> Fixture {
        let store = InMemoryBatchStore::arc();
        let messages = InMemoryFailedMessageStore::arc();
        let tracker = Arc::new(RetryingManager::new(Arc::new(
            InMemoryEventBus::<Notification>::new(),
        )));
        let gateway = RetriesGateway::new(
            store.clone(),
            messages.clone(),
            tracker.clone(),
            SessionId::new(),
        );
        Fixture { store, messages, tracker, gateway }
    }

    fn failed(id: &str, endpoint: &str, group: Option<&str>) -> FailedMessage {
        FailedMessage {
            id: FailedMessageId::new(id).unwrap(),
            status: FailedMessageStatus::Unresolved,
            processing_attempts: vec![ProcessingAttempt {
                message_id: format!("wire-{id}"),
                receiving_endpoint: Some(endpoint.to_string()),
                headers: Headers::new(),
                body: Vec::new(),
                failure_details: FailureDetails {
                    address_of_failing_endpoint: format!("{endpoint}@box"),
                    time_of_failure: Utc::now(),
                    exception: ExceptionDetails {
                        exception_type: "System.Exception".to_string(),
                        message: "boom".to_string(),
                    },
                },
            }],
            failure_groups: group
                .map(|g| FailureGroup {
                    id: g.to_string(),
                    title: g.to_string(),
                    group_type: "Exception Type".to_string(),
                })
                .into_iter()
                .collect(),
        }
    }

    #[tokio::test]
    async fn single_message_creates_one_staging_batch() {
        let f = fixture();
        let id = FailedMessageId::new("msg-1").unwrap();

        f.gateway.start_retry_for_single_message(id.clone()).await.unwrap();

        let batches = f.store.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].status, RetryBatchStatus::Staging);
        assert_eq!(batches[0].retry_type, RetryType::SingleMessage);
        assert_eq!(batches[0].request_id.as_ref().map(RequestId::as_str), Some("msg-1"));

        let status = f.tracker.status(&RequestId::new("msg-1").unwrap(), RetryType::SingleMessage).unwrap();
        assert_eq!(status.operation.state, RetryState::Preparing);
        assert_eq!(status.operation.number_of_messages_prepared, 1);
    }

    #[tokio::test]
    async fn selection_deduplicates_ids_ignoring_case() {
        let f = fixture();
        let ids = ["a", "A", "b"].iter().map(|s| FailedMessageId::new(*s).unwrap()).collect();

        let request_id = f.gateway.start_retry_for_message_selection(ids).await.unwrap();

        let batches = f.store.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].initial_batch_size, 2);
        let status = f.tracker.status(&request_id, RetryType::MultipleMessages).unwrap();
        assert_eq!(status.operation.total_number_of_messages, 2);
    }

    #[tokio::test]
    async fn bulk_requests_are_deferred_and_chunked() {
        let f = fixture();
        for i in 0..2500 {
            f.messages.insert(failed(&format!("s-{i:04}"), "Sales", None)).unwrap();
        }
        f.messages.insert(failed("b-1", "Billing", None)).unwrap();

        f.gateway.start_retry_for_endpoint("Sales").unwrap();
        assert!(f.store.batches().is_empty());
        assert_eq!(f.gateway.pending_bulk_requests(), 1);

        assert!(f.gateway.process_next_bulk_retry().await.unwrap());
        assert!(!f.gateway.process_next_bulk_retry().await.unwrap());

        let mut sizes: Vec<_> = f.store.batches().iter().map(|b| b.initial_batch_size).collect();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![500, 1000, 1000]);
        assert!(f.store.batches().iter().all(|b| b.last.is_some()));
        assert_eq!(f.store.failure_retry_count(), 2500);

        let mut names: Vec<_> = f.store.batches().into_iter().filter_map(|b| b.originator).collect();
        names.sort();
        assert_eq!(names[0], "'Sales' batch 1 of 3");

        let status = f.tracker.status(&RequestId::new("Sales").unwrap(), RetryType::AllForEndpoint).unwrap();
        assert_eq!(status.operation.total_number_of_messages, 2500);
        assert_eq!(status.operation.number_of_messages_prepared, 2500);
    }

    #[tokio::test]
    async fn bulk_request_is_skipped_while_operation_in_progress_or_empty() {
        let f = fixture();
        f.messages.insert(failed("g-1", "Sales", Some("group-1"))).unwrap();

        f.gateway.enqueue_retry_for_failure_group("group-2", None, None, Utc::now()).unwrap();
        assert!(f.gateway.process_next_bulk_retry().await.unwrap());
        assert!(f.store.batches().is_empty());

        f.gateway
            .enqueue_retry_for_failure_group("group-1", Some("Group 1".into()), None, Utc::now())
            .unwrap();
        f.gateway
            .enqueue_retry_for_failure_group("group-1", Some("Group 1".into()), None, Utc::now())
            .unwrap();
        f.gateway.process_next_bulk_retry().await.unwrap();
        f.gateway.process_next_bulk_retry().await.unwrap();

        assert_eq!(f.store.batches().len(), 1);
    }

    #[test]
    fn batch_names_need_a_context() {
        assert_eq!(batch_name(2, 3, Some("Sales")).as_deref(), Some("'Sales' batch 2 of 3"));
        assert_eq!(batch_name(1, 1, None), None);
    }
}
