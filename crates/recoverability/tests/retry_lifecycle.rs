use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{Duration, Utc};

use busmon_core::{
    FailedMessageId, FailedMessageRetryId, RequestId, RetryBatchId, RetryState, RetryType,
    SessionId,
};
use busmon_events::{EventBus, InMemoryEventBus, Notification, RecoverabilityEvent};
use busmon_recoverability::documents::{RetryBatch, RetryBatchNowForwarding, RetryBatchStatus};
use busmon_recoverability::failed_message::{
    ExceptionDetails, FailedMessage, FailedMessageStatus, FailureDetails, FailureGroup, Headers,
    ProcessingAttempt,
};
use busmon_recoverability::operations::RetryingManager;
use busmon_recoverability::retries::MAX_STAGING_ATTEMPTS;
use busmon_recoverability::scheduler::CancellationSignal;
use busmon_recoverability::store::{BatchStore, InMemoryBatchStore, InMemoryFailedMessageStore};
use busmon_recoverability::transport::InMemoryTransport;
use busmon_recoverability::{
    ProcessOutcome, RecoverabilityConfig, RetriesGateway, RetryDocumentManager, RetryProcessor,
};

const STAGING: &str = "busmon.staging";

/// Shared durable state; survives a simulated restart.
struct Durable {
    store: Arc<InMemoryBatchStore>,
    messages: Arc<InMemoryFailedMessageStore>,
    transport: Arc<InMemoryTransport>,
}

/// Per-process state; a restart builds a fresh one.
struct Session {
    session_id: SessionId,
    bus: Arc<InMemoryEventBus<Notification>>,
    tracker: Arc<RetryingManager>,
    gateway: RetriesGateway,
    documents: RetryDocumentManager,
    processor: RetryProcessor,
}

impl Durable {
    fn new() -> Self {
        Self {
            store: InMemoryBatchStore::arc(),
            messages: InMemoryFailedMessageStore::arc(),
            transport: InMemoryTransport::arc(),
        }
    }

    fn session(&self) -> Session {
        let session_id = SessionId::new();
        let bus = Arc::new(InMemoryEventBus::<Notification>::new());
        let tracker = Arc::new(RetryingManager::new(bus.clone()));
        Session {
            session_id,
            gateway: RetriesGateway::new(
                self.store.clone(),
                self.messages.clone(),
                tracker.clone(),
                session_id,
            ),
            documents: RetryDocumentManager::new(self.store.clone(), tracker.clone(), session_id),
            processor: RetryProcessor::new(
                self.store.clone(),
                self.messages.clone(),
                self.transport.clone(),
                tracker.clone(),
                bus.clone(),
                &RecoverabilityConfig::default(),
            ),
            tracker,
            bus,
        }
    }

    fn add_failures(&self, prefix: &str, endpoint: &str, group: Option<&str>, n: usize) -> Vec<FailedMessageId> {
        (0..n)
            .map(|i| {
                let id = FailedMessageId::new(format!("{prefix}-{i:05}")).unwrap();
                self.messages.insert(failed(&id, endpoint, group)).unwrap();
                id
            })
            .collect()
    }

    fn forwarding_batches(&self) -> usize {
        self.store
            .batches()
            .iter()
            .filter(|b| b.status == RetryBatchStatus::Forwarding)
            .count()
    }
}

impl Session {
    /// Tick until the processor reports nothing to do.
    async fn drain(&self) {
        for _ in 0..1000 {
            if self.processor.process_batches().await.unwrap() == ProcessOutcome::Idle {
                return;
            }
        }
        panic!("processor never went idle");
    }
}

fn failed(id: &FailedMessageId, endpoint: &str, group: Option<&str>) -> FailedMessage {
    FailedMessage {
        id: id.clone(),
        status: FailedMessageStatus::Unresolved,
        processing_attempts: vec![ProcessingAttempt {
            message_id: format!("wire-{id}"),
            receiving_endpoint: Some(endpoint.to_string()),
            headers: Headers::new(),
            body: Vec::new(),
            failure_details: FailureDetails {
                address_of_failing_endpoint: format!("{}@box", endpoint.to_lowercase()),
                time_of_failure: Utc::now(),
                exception: ExceptionDetails {
                    exception_type: "System.InvalidOperationException".to_string(),
                    message: "boom".to_string(),
                },
            },
        }],
        failure_groups: group
            .map(|g| FailureGroup {
                id: g.to_string(),
                title: format!("{g} title"),
                group_type: "Exception Type and Stack Trace".to_string(),
            })
            .into_iter()
            .collect(),
    }
}

#[tokio::test]
async fn endpoint_retry_runs_to_completion() {
    let durable = Durable::new();
    durable.add_failures("sales", "Sales", None, 2500);
    durable.add_failures("billing", "Billing", None, 10);
    let session = durable.session();
    let request_id = RequestId::new("Sales").unwrap();

    session.gateway.start_retry_for_endpoint("Sales").unwrap();
    assert!(session.gateway.process_next_bulk_retry().await.unwrap());

    let mut sizes: Vec<_> = durable.store.batches().iter().map(|b| b.initial_batch_size).collect();
    sizes.sort_unstable();
    assert_eq!(sizes, vec![500, 1000, 1000]);
    let status = session.tracker.status(&request_id, RetryType::AllForEndpoint).unwrap();
    assert_eq!(status.operation.total_number_of_messages, 2500);

    session.drain().await;

    let status = session.tracker.status(&request_id, RetryType::AllForEndpoint).unwrap();
    assert_eq!(status.operation.state, RetryState::Completed);
    assert_eq!(
        status.operation.number_of_messages_forwarded + status.operation.number_of_messages_skipped,
        2500
    );
    assert_eq!(status.percentage, 1.0);
    assert!(durable.store.batches().is_empty());
    assert_eq!(durable.store.failure_retry_count(), 0);
    assert_eq!(durable.transport.queue_len("sales@box"), 2500);
    assert_eq!(durable.transport.queue_len("billing@box"), 0);
    assert_eq!(durable.transport.queue_len(STAGING), 0);
}

#[tokio::test]
async fn failure_group_reports_submission_on_completion() {
    let durable = Durable::new();
    durable.add_failures("g", "Sales", Some("group-1"), 4);
    let session = durable.session();
    let sub = session.bus.subscribe();

    session
        .gateway
        .enqueue_retry_for_failure_group("group-1", Some("NullReference".to_string()), None, Utc::now())
        .unwrap();
    session.gateway.process_next_bulk_retry().await.unwrap();
    session.drain().await;

    let submitted: Vec<_> = sub
        .drain()
        .into_iter()
        .map(Notification::into_event)
        .filter(|e| matches!(e, RecoverabilityEvent::MessagesSubmittedForRetry { .. }))
        .collect();
    assert!(matches!(
        submitted.as_slice(),
        [RecoverabilityEvent::MessagesSubmittedForRetry { number_of_failed_messages: 4, .. }]
    ));
}

#[tokio::test]
async fn batch_abandoned_while_marking_is_adopted_after_restart() {
    let durable = Durable::new();
    let ids = durable.add_failures("sales", "Sales", None, 3);

    // The previous process linked the members but died before staging.
    let crashed = SessionId::new();
    let batch = RetryBatch::new(
        crashed,
        Some(RequestId::new("Sales").unwrap()),
        RetryType::AllForEndpoint,
        ids.iter().map(FailedMessageRetryId::for_message).collect(),
        Utc::now(),
    );
    let batch_id = durable.store.create_batch(batch).await.unwrap();
    durable.store.link_members(batch_id, &ids).await.unwrap();

    let session = durable.session();
    assert_ne!(session.session_id, crashed);
    session.documents.rebuild_retry_operation_state().await.unwrap();
    assert_eq!(session.processor.process_batches().await.unwrap(), ProcessOutcome::Idle);

    let cutoff = Utc::now() + Duration::seconds(1);
    let signal = CancellationSignal::never();
    assert!(session.documents.adopt_orphaned_batches(cutoff, &signal).await.unwrap());
    assert!(!session.documents.adopt_orphaned_batches(cutoff, &signal).await.unwrap());

    let adopted = durable.store.get_batch(batch_id).await.unwrap().unwrap();
    assert_eq!(adopted.status, RetryBatchStatus::Staging);
    assert_eq!(adopted.session_id, session.session_id);

    session.drain().await;

    assert!(durable.store.get_batch(batch_id).await.unwrap().is_none());
    assert_eq!(durable.transport.queue_len("sales@box"), 3);
    let status = session
        .tracker
        .status(&RequestId::new("Sales").unwrap(), RetryType::AllForEndpoint)
        .unwrap();
    assert_eq!(status.operation.state, RetryState::Completed);
    assert!(status.operation.failed);
}

#[tokio::test]
async fn forwarding_resumes_after_restart_and_delivers_once() {
    let durable = Durable::new();
    durable.add_failures("sales", "Sales", None, 3);
    let request_id = RequestId::new("Sales").unwrap();

    let first = durable.session();
    first.gateway.start_retry_for_endpoint("Sales").unwrap();
    first.gateway.process_next_bulk_retry().await.unwrap();
    assert_eq!(first.processor.process_batches().await.unwrap(), ProcessOutcome::Advanced);
    assert_eq!(durable.forwarding_batches(), 1);
    assert!(durable.store.forwarding_marker().await.unwrap().is_some());
    drop(first);

    let second = durable.session();
    second.documents.rebuild_retry_operation_state().await.unwrap();
    let rebuilt = second.tracker.status(&request_id, RetryType::AllForEndpoint).unwrap();
    assert_eq!(rebuilt.operation.total_number_of_messages, 3);

    assert_eq!(second.processor.process_batches().await.unwrap(), ProcessOutcome::Advanced);
    assert!(durable.store.batches().is_empty());
    assert!(durable.store.forwarding_marker().await.unwrap().is_none());

    second.drain().await;
    assert_eq!(durable.transport.queue_len("sales@box"), 3);
    assert_eq!(durable.transport.queue_len(STAGING), 0);
    let status = second.tracker.status(&request_id, RetryType::AllForEndpoint).unwrap();
    assert_eq!(status.operation.state, RetryState::Completed);
}

#[tokio::test]
async fn reclaimed_message_is_dispatched_once() {
    let durable = Durable::new();
    let ids = durable.add_failures("m", "Sales", None, 2);
    let session = durable.session();

    let first = session.gateway.start_retry_for_message_selection(ids.clone()).await.unwrap();
    let second = session.gateway.start_retry_for_message_selection(vec![ids[1].clone()]).await.unwrap();

    session.drain().await;

    assert_eq!(durable.transport.queue_len("sales@box"), 2);
    for request_id in [first, second] {
        let status = session.tracker.status(&request_id, RetryType::MultipleMessages).unwrap();
        assert_eq!(status.operation.state, RetryState::Completed);
    }
}

#[tokio::test]
async fn message_failing_staging_is_dropped_and_reported_once() {
    let durable = Durable::new();
    let ids = durable.add_failures("m", "Sales", None, 3);
    durable.transport.fail_dispatch(format!("wire-{}", ids[0]), MAX_STAGING_ATTEMPTS);
    let session = durable.session();
    let sub = session.bus.subscribe();

    let request_id = session.gateway.start_retry_for_message_selection(ids.clone()).await.unwrap();
    session.drain().await;

    let failed: Vec<_> = sub
        .drain()
        .into_iter()
        .map(Notification::into_event)
        .filter_map(|e| match e {
            RecoverabilityEvent::MessageFailedInStaging { failed_message_id } => Some(failed_message_id),
            _ => None,
        })
        .collect();
    assert_eq!(failed, vec![ids[0].clone()]);

    let delivered: Vec<_> = durable
        .transport
        .messages_in("sales@box")
        .into_iter()
        .map(|m| m.message_id)
        .collect();
    assert_eq!(delivered.len(), 2);
    assert!(!delivered.contains(&format!("wire-{}", ids[0])));

    let status = session.tracker.status(&request_id, RetryType::MultipleMessages).unwrap();
    assert_eq!(status.operation.state, RetryState::Completed);
    assert_eq!(status.operation.number_of_messages_skipped, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn forwarding_claim_is_exclusive() {
    let store = InMemoryBatchStore::arc();
    let claims: Vec<_> = (0..8)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .insert_forwarding_marker(RetryBatchNowForwarding { retry_batch_id: RetryBatchId::new() })
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut won = 0;
    for claim in claims {
        if claim.await.unwrap() {
            won += 1;
        }
    }
    assert_eq!(won, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn processor_loop_runs_alongside_new_requests() {
    let durable = Arc::new(Durable::new());
    let ids = durable.add_failures("m", "Sales", None, 40);
    let session = Arc::new(durable.session());

    let requests_done = Arc::new(AtomicBool::new(false));
    let watch_done = Arc::new(AtomicBool::new(false));

    let watcher = {
        let durable = durable.clone();
        let done = watch_done.clone();
        tokio::spawn(async move {
            let mut max_forwarding = 0;
            while !done.load(Ordering::SeqCst) {
                max_forwarding = max_forwarding.max(durable.forwarding_batches());
                tokio::task::yield_now().await;
            }
            max_forwarding
        })
    };

    let requests = {
        let session = session.clone();
        let done = requests_done.clone();
        tokio::spawn(async move {
            for chunk in ids.chunks(5) {
                session
                    .gateway
                    .start_retry_for_message_selection(chunk.to_vec())
                    .await
                    .unwrap();
                tokio::task::yield_now().await;
            }
            done.store(true, Ordering::SeqCst);
        })
    };

    let processor = {
        let durable = durable.clone();
        let session = session.clone();
        let done = requests_done.clone();
        tokio::spawn(async move {
            loop {
                let finished = done.load(Ordering::SeqCst);
                let outcome = session.processor.process_batches().await.unwrap();
                if finished && outcome == ProcessOutcome::Idle && durable.store.batches().is_empty() {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
    };

    requests.await.unwrap();
    processor.await.unwrap();
    watch_done.store(true, Ordering::SeqCst);

    assert!(watcher.await.unwrap() <= 1);
    assert!(durable.store.forwarding_marker().await.unwrap().is_none());
    assert_eq!(durable.transport.queue_len("sales@box"), 40);
    assert_eq!(durable.store.failure_retry_count(), 0);
}
