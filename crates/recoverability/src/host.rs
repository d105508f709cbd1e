//! Wiring of the retry pipeline onto periodic timer jobs.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info};

use busmon_core::SessionId;
use busmon_events::DomainEvents;

use crate::circuit_breaker::CircuitBreakerHooks;
use crate::config::RecoverabilityConfig;
use crate::error::RecoverabilityResult;
use crate::operations::{ArchivingManager, RetryingManager};
use crate::retries::{ProcessOutcome, RetriesGateway, RetryDocumentManager, RetryProcessor};
use crate::scheduler::{TimerJob, TimerJobExecutionResult, TimerScheduler};
use crate::store::{BatchStore, FailedMessageStore};
use crate::transport::TransportDispatcher;

const BULK_RETRY_JOB: &str = "bulk-retry-requests";
const ORPHAN_ADOPTION_JOB: &str = "orphaned-batch-adoption";
const PROCESSOR_JOB: &str = "retry-processor";

/// External collaborators the host runs against.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn BatchStore>,
    pub messages: Arc<dyn FailedMessageStore>,
    pub transport: Arc<dyn TransportDispatcher>,
    pub events: Arc<dyn DomainEvents>,
}

/// Owns the gateway, document manager, processor and operation trackers of
/// one process incarnation, and the timer jobs that drive them.
pub struct RecoverabilityHost {
    config: RecoverabilityConfig,
    session_id: SessionId,
    gateway: Arc<RetriesGateway>,
    document_manager: Arc<RetryDocumentManager>,
    processor: Arc<RetryProcessor>,
    retrying: Arc<RetryingManager>,
    archiving: Arc<ArchivingManager>,
    scheduler: TimerScheduler,
    jobs: Mutex<Vec<TimerJob>>,
}

impl RecoverabilityHost {
    pub fn new(config: RecoverabilityConfig, collaborators: Collaborators) -> Self {
        Self::build(config, collaborators, None)
    }

    /// Like [`RecoverabilityHost::new`], with caller-supplied actions for the
    /// forwarding circuit breaker (typically a fatal trigger action).
    pub fn with_forwarding_hooks(
        config: RecoverabilityConfig,
        collaborators: Collaborators,
        hooks: CircuitBreakerHooks,
    ) -> Self {
        Self::build(config, collaborators, Some(hooks))
    }

    fn build(
        config: RecoverabilityConfig,
        collaborators: Collaborators,
        hooks: Option<CircuitBreakerHooks>,
    ) -> Self {
        let Collaborators {
            store,
            messages,
            transport,
            events,
        } = collaborators;
        let session_id = SessionId::new();
        let retrying = Arc::new(RetryingManager::new(events.clone()));
        let archiving = Arc::new(ArchivingManager::new(events.clone()));

        let gateway = RetriesGateway::new(store.clone(), messages.clone(), retrying.clone(), session_id);
        let document_manager = RetryDocumentManager::new(store.clone(), retrying.clone(), session_id);
        let mut processor = RetryProcessor::new(store, messages, transport, retrying.clone(), events, &config);
        if let Some(hooks) = hooks {
            processor = processor.with_forwarding_hooks(hooks);
        }

        Self {
            config,
            session_id,
            gateway: Arc::new(gateway),
            document_manager: Arc::new(document_manager),
            processor: Arc::new(processor),
            retrying,
            archiving,
            scheduler: TimerScheduler::new(),
            jobs: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &RecoverabilityConfig {
        &self.config
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn gateway(&self) -> &Arc<RetriesGateway> {
        &self.gateway
    }

    pub fn document_manager(&self) -> &Arc<RetryDocumentManager> {
        &self.document_manager
    }

    pub fn processor(&self) -> &Arc<RetryProcessor> {
        &self.processor
    }

    /// Read side of retry operations.
    pub fn retrying(&self) -> &Arc<RetryingManager> {
        &self.retrying
    }

    /// Read side of archive operations.
    pub fn archiving(&self) -> &Arc<ArchivingManager> {
        &self.archiving
    }

    /// Rebuild tracker state from in-flight batches, then start the bulk
    /// drain, orphan adoption and processor loops.
    pub async fn start(&self) -> RecoverabilityResult<()> {
        self.document_manager.rebuild_retry_operation_state().await?;
        let started_at = Utc::now();

        let gateway = self.gateway.clone();
        let bulk = self.scheduler.schedule(
            BULK_RETRY_JOB,
            move |_cancel| {
                let gateway = gateway.clone();
                async move {
                    let processed = gateway.process_next_bulk_retry().await?;
                    Ok::<_, anyhow::Error>(if processed {
                        TimerJobExecutionResult::ExecuteImmediately
                    } else {
                        TimerJobExecutionResult::ScheduleNextExecution
                    })
                }
            },
            Duration::ZERO,
            self.config.bulk_retry_interval,
            log_tick_error(BULK_RETRY_JOB),
        );

        // Batches created before this process started and never finished by
        // their own session are orphans.
        let manager = self.document_manager.clone();
        let orphans = self.scheduler.schedule(
            ORPHAN_ADOPTION_JOB,
            move |cancel| {
                let manager = manager.clone();
                async move {
                    let needs_more_polling = manager.adopt_orphaned_batches(started_at, &cancel).await?;
                    Ok::<_, anyhow::Error>(if needs_more_polling {
                        TimerJobExecutionResult::ScheduleNextExecution
                    } else {
                        TimerJobExecutionResult::DoNotContinueExecuting
                    })
                }
            },
            Duration::ZERO,
            self.config.orphan_adoption_interval,
            log_tick_error(ORPHAN_ADOPTION_JOB),
        );

        let processor = self.processor.clone();
        let batches = self.scheduler.schedule(
            PROCESSOR_JOB,
            move |_cancel| {
                let processor = processor.clone();
                async move {
                    Ok::<_, anyhow::Error>(match processor.process_batches().await? {
                        ProcessOutcome::Advanced | ProcessOutcome::RetryNow => {
                            TimerJobExecutionResult::ExecuteImmediately
                        }
                        ProcessOutcome::Idle => TimerJobExecutionResult::ScheduleNextExecution,
                    })
                }
            },
            Duration::ZERO,
            self.config.processor_interval,
            log_tick_error(PROCESSOR_JOB),
        );

        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([bulk, orphans, batches]);

        info!(session_id = %self.session_id, "recoverability host started");
        Ok(())
    }

    /// Number of timer jobs still running.
    pub fn running_jobs(&self) -> usize {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|job| !job.is_finished())
            .count()
    }

    /// Cancel pending waits and wait for in-flight ticks to finish.
    pub async fn shutdown(&self) {
        let jobs = std::mem::take(&mut *self.jobs.lock().unwrap_or_else(PoisonError::into_inner));
        for job in jobs {
            job.stop().await;
        }
        info!(session_id = %self.session_id, "recoverability host stopped");
    }
}

fn log_tick_error(job: &'static str) -> impl Fn(&anyhow::Error) + Send + Sync + 'static {
    move |err| error!(job, error = %err, "timer job tick failed")
}

impl std::fmt::Debug for RecoverabilityHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoverabilityHost")
            .field("session_id", &self.session_id)
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failed_message::{
        ExceptionDetails, FailedMessage, FailedMessageStatus, FailureDetails, Headers,
        ProcessingAttempt,
    };
    use crate::store::{InMemoryBatchStore, InMemoryFailedMessageStore};
    use crate::transport::InMemoryTransport;
    use busmon_core::{FailedMessageId, RequestId, RetryState, RetryType};
    use busmon_events::{InMemoryEventBus, Notification};

    fn failed(id: &str) -> FailedMessage {
        FailedMessage {
            id: FailedMessageId::new(id).unwrap(),
            status: FailedMessageStatus::Unresolved,
            processing_attempts: vec![ProcessingAttempt {
                message_id: format!("wire-{id}"),
                receiving_endpoint: Some("Sales".to_string()),
                headers: Headers::new(),
                body: Vec::new(),
                failure_details: FailureDetails {
                    address_of_failing_endpoint: "sales@box".to_string(),
                    time_of_failure: Utc::now(),
                    exception: ExceptionDetails {
                        exception_type: "System.Exception".to_string(),
                        message: "boom".to_string(),
                    },
                },
            }],
            failure_groups: Vec::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn loops_drain_a_bulk_retry() {
        let messages = InMemoryFailedMessageStore::arc();
        for i in 0..3 {
            messages.insert(failed(&format!("m-{i}"))).unwrap();
        }
        let transport = InMemoryTransport::arc();
        let host = RecoverabilityHost::new(
            RecoverabilityConfig::default(),
            Collaborators {
                store: InMemoryBatchStore::arc(),
                messages: messages.clone(),
                transport: transport.clone(),
                events: Arc::new(InMemoryEventBus::<Notification>::new()),
            },
        );

        host.start().await.unwrap();
        host.gateway().start_retry_for_endpoint("Sales").unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;

        let status = host
            .retrying()
            .status(&RequestId::new("Sales").unwrap(), RetryType::AllForEndpoint)
            .unwrap();
        assert_eq!(status.operation.state, RetryState::Completed);
        assert_eq!(transport.queue_len("sales@box"), 3);
        assert_eq!(messages.count_with_status(FailedMessageStatus::RetryIssued), 3);

        // Nothing was orphaned, so adoption stopped after its first pass.
        assert_eq!(host.running_jobs(), 2);

        host.shutdown().await;
        assert_eq!(host.running_jobs(), 0);
    }
}
