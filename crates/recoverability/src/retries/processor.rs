//! Stages retry batches and forwards staged messages.
//!
//! Each tick does one step. Forwarding comes first: while the forwarding
//! marker exists, its batch is forwarded and nothing new is staged.
//! Otherwise the oldest Staging batch is claimed with the marker and staged.
//! The marker is created with an atomic create-if-absent, so at most one
//! batch is ever between staging and the end of forwarding.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::join_all;
use tracing::{debug, error, info, warn};

use busmon_core::{FailedMessageId, FailedMessageRetryId, RetryBatchId, RetryType, StagingId};
use busmon_events::{DomainEvents, RecoverabilityEvent};

use super::log_tracker_error;
use crate::circuit_breaker::{
    BreakerState, CircuitBreakerConfig, CircuitBreakerHooks, RepeatedFailuresCircuitBreaker,
};
use crate::config::RecoverabilityConfig;
use crate::documents::{FailedMessageRetry, RetryBatch, RetryBatchNowForwarding, RetryBatchStatus};
use crate::error::{RecoverabilityError, RecoverabilityResult, StoreError};
use crate::failed_message::{FailedMessage, MessageRedirects};
use crate::headers::{RetryHeaders, fix_corrupted_reply_to, remove_error_headers};
use crate::operations::RetryingManager;
use crate::store::{BatchStore, FailedMessageStore, SessionFilter};
use crate::transport::{OutgoingMessage, TransportDispatcher};

/// Failed staging attempts after which a message is dropped from its batch.
pub const MAX_STAGING_ATTEMPTS: u32 = 5;

/// Result of one processor tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// A batch moved forward; there may be more work.
    Advanced,
    /// Staging failed for some messages below the attempt cap; tick again now.
    RetryNow,
    /// Nothing to do.
    Idle,
}

enum StageOutcome {
    Staged(usize),
    RetryNow,
}

/// Retry batch processor.
pub struct RetryProcessor {
    store: Arc<dyn BatchStore>,
    messages: Arc<dyn FailedMessageStore>,
    transport: Arc<dyn TransportDispatcher>,
    tracker: Arc<RetryingManager>,
    events: Arc<dyn DomainEvents>,
    staging_address: String,
    local_machine_name: String,
    forwarding_breaker: RepeatedFailuresCircuitBreaker,
    // Set until the first successful tick: a marker found then was left by a
    // previous run, which may already have forwarded part of its batch.
    recovering_from_premature_shutdown: AtomicBool,
    // Batch this processor is staging right now under the forwarding marker.
    staging_claim: Mutex<Option<RetryBatchId>>,
}

/// Holds the in-flight staging claim; cleared on drop so a cancelled tick
/// leaves no claim behind.
struct StagingClaim<'a> {
    slot: &'a Mutex<Option<RetryBatchId>>,
}

impl<'a> StagingClaim<'a> {
    fn hold(slot: &'a Mutex<Option<RetryBatchId>>, batch_id: RetryBatchId) -> Self {
        *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(batch_id);
        Self { slot }
    }
}

impl Drop for StagingClaim<'_> {
    fn drop(&mut self) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl RetryProcessor {
    pub fn new(
        store: Arc<dyn BatchStore>,
        messages: Arc<dyn FailedMessageStore>,
        transport: Arc<dyn TransportDispatcher>,
        tracker: Arc<RetryingManager>,
        events: Arc<dyn DomainEvents>,
        config: &RecoverabilityConfig,
    ) -> Self {
        Self {
            store,
            messages,
            transport,
            tracker,
            events,
            staging_address: config.staging_address.clone(),
            local_machine_name: config.local_machine_name.clone(),
            forwarding_breaker: forwarding_breaker(config.forwarding_breaker, default_hooks()),
            recovering_from_premature_shutdown: AtomicBool::new(true),
            staging_claim: Mutex::new(None),
        }
    }

    /// Replace the forwarding breaker's hooks, e.g. with a fatal trigger
    /// action supplied by the host.
    pub fn with_forwarding_hooks(mut self, hooks: CircuitBreakerHooks) -> Self {
        self.forwarding_breaker = forwarding_breaker(self.forwarding_breaker.config(), hooks);
        self
    }

    pub fn forwarding_breaker_state(&self) -> BreakerState {
        self.forwarding_breaker.state()
    }

    /// Run one step of the pipeline.
    ///
    /// Recovery mode lasts until a tick succeeds, so a forward that fails
    /// right after a restart is retried with an unknown message count.
    pub async fn process_batches(&self) -> RecoverabilityResult<ProcessOutcome> {
        let recovering = self.recovering_from_premature_shutdown.load(Ordering::SeqCst);

        let outcome = match self.store.forwarding_marker().await? {
            Some(marker) => self.forward_step(marker, recovering).await?,
            None => self.stage_step().await?,
        };

        self.recovering_from_premature_shutdown.store(false, Ordering::SeqCst);
        Ok(outcome)
    }

    fn is_staging(&self, batch_id: RetryBatchId) -> bool {
        *self.staging_claim.lock().unwrap_or_else(PoisonError::into_inner) == Some(batch_id)
    }

    async fn forward_step(
        &self,
        marker: RetryBatchNowForwarding,
        recovering: bool,
    ) -> RecoverabilityResult<ProcessOutcome> {
        let batch_id = marker.retry_batch_id;

        match self.store.get_batch(batch_id).await? {
            None => {
                warn!(batch_id = %batch_id, "forwarding marker points at a missing batch; clearing it");
            }
            Some(batch) if batch.status == RetryBatchStatus::Forwarding => {
                self.forward(&batch, recovering).await?;
            }
            Some(_) if self.is_staging(batch_id) => {
                debug!(batch_id = %batch_id, "batch is still being staged");
                return Ok(ProcessOutcome::Idle);
            }
            // Only this processor stages, so a claim it is not holding was
            // left by an earlier run or by a failed release.
            Some(_) => {
                warn!(batch_id = %batch_id, recovering, "clearing stale forwarding claim");
            }
        }

        self.store.delete_forwarding_marker(batch_id).await?;
        Ok(ProcessOutcome::Advanced)
    }

    async fn stage_step(&self) -> RecoverabilityResult<ProcessOutcome> {
        let staging = self
            .store
            .query_by_status(RetryBatchStatus::Staging, SessionFilter::Any)
            .await?;
        let Some(batch) = staging.into_iter().next() else {
            return Ok(ProcessOutcome::Idle);
        };

        let claim = RetryBatchNowForwarding { retry_batch_id: batch.id };
        if !self.store.insert_forwarding_marker(claim).await? {
            debug!(batch_id = %batch.id, "another batch holds the forwarding marker");
            return Ok(ProcessOutcome::Idle);
        }

        let staged = {
            let _claim = StagingClaim::hold(&self.staging_claim, batch.id);
            self.stage(&batch).await
        };

        match staged {
            // The marker stays; the next tick forwards.
            Ok(StageOutcome::Staged(n)) if n > 0 => Ok(ProcessOutcome::Advanced),
            Ok(StageOutcome::Staged(_)) => {
                self.store.delete_forwarding_marker(batch.id).await?;
                Ok(ProcessOutcome::Advanced)
            }
            Ok(StageOutcome::RetryNow) => {
                self.store.delete_forwarding_marker(batch.id).await?;
                Ok(ProcessOutcome::RetryNow)
            }
            Err(err) => {
                if let Err(release) = self.store.delete_forwarding_marker(batch.id).await {
                    warn!(batch_id = %batch.id, error = %release, "failed to release forwarding claim");
                }
                Err(err)
            }
        }
    }

    async fn stage(&self, batch: &RetryBatch) -> RecoverabilityResult<StageOutcome> {
        let staging_id = StagingId::new();
        let request_id = batch.request_id.as_ref();

        let markers = self.store.load_failure_retries(&batch.failure_retries).await?;
        let mut seen = HashSet::new();
        let claimed: Vec<FailedMessageRetry> = markers
            .into_iter()
            .filter(|m| m.is_claimed_by(batch.id))
            .filter(|m| seen.insert(m.failed_message_id.normalized()))
            .collect();

        if claimed.is_empty() {
            self.store.delete_batch(batch.id).await?;
            log_tracker_error(self.tracker.skip(request_id, batch.retry_type, batch.initial_batch_size));
            info!(batch_id = %batch.id, "retry batch has no claimed members; deleted");
            return Ok(StageOutcome::Staged(0));
        }

        let ids: Vec<FailedMessageId> = claimed.iter().map(|m| m.failed_message_id.clone()).collect();
        let loaded: HashMap<String, FailedMessage> = self
            .messages
            .load_messages(&ids)
            .await?
            .into_iter()
            .map(|m| (m.id.normalized(), m))
            .collect();
        let redirects = self.messages.message_redirects().await?;

        let (loaded, redirects) = (&loaded, &redirects);
        let attempts = claimed.iter().map(move |marker| {
            let message = loaded.get(&marker.failed_message_id.normalized());
            async move {
                let result = match message {
                    Some(message) => self.try_stage_message(message, staging_id, redirects).await,
                    None => Err(StoreError::MessageNotFound(marker.failed_message_id.clone()).into()),
                };
                (marker, result)
            }
        });
        let results = join_all(attempts).await;

        let mut staged: Vec<(FailedMessageRetryId, FailedMessageId)> = Vec::with_capacity(results.len());
        let mut retry_needed = false;
        for (marker, result) in results {
            let Err(err) = result else {
                staged.push((marker.id, marker.failed_message_id.clone()));
                continue;
            };

            let attempt = self.store.increment_stage_attempts(marker.id).await?;
            if attempt >= MAX_STAGING_ATTEMPTS {
                warn!(
                    batch_id = %batch.id,
                    failed_message_id = %marker.failed_message_id,
                    attempt,
                    error = %err,
                    "staging failed too many times; dropping message from batch"
                );
                self.store.delete_failure_retry(marker.id).await?;
                self.events.raise(RecoverabilityEvent::MessageFailedInStaging {
                    failed_message_id: marker.failed_message_id.clone(),
                });
            } else {
                warn!(
                    batch_id = %batch.id,
                    failed_message_id = %marker.failed_message_id,
                    attempt,
                    error = %err,
                    "staging failed; will retry"
                );
                retry_needed = true;
            }
        }

        if retry_needed {
            return Ok(StageOutcome::RetryNow);
        }

        let staged_count = staged.len();
        if staged_count == 0 {
            self.store.delete_batch(batch.id).await?;
            log_tracker_error(self.tracker.skip(request_id, batch.retry_type, batch.initial_batch_size));
            info!(batch_id = %batch.id, "no message in retry batch could be staged; deleted");
            return Ok(StageOutcome::Staged(0));
        }

        let (staged_ids, staged_messages): (Vec<_>, Vec<_>) = staged.into_iter().unzip();
        self.store
            .move_to_forwarding(batch.id, staging_id, staged_ids)
            .await?;

        let skipped = batch.initial_batch_size.saturating_sub(staged_count);
        if skipped > 0 {
            log_tracker_error(self.tracker.skip(request_id, batch.retry_type, skipped));
        }

        // Failure-group retries report once, when the operation completes.
        if batch.retry_type != RetryType::FailureGroup {
            self.events.raise(RecoverabilityEvent::MessagesSubmittedForRetry {
                failed_message_ids: staged_messages,
                number_of_failed_messages: staged_count,
                context: batch.originator.clone(),
            });
        }

        info!(
            batch_id = %batch.id,
            staging_id = %staging_id,
            staged = staged_count,
            skipped,
            "retry batch staged"
        );
        Ok(StageOutcome::Staged(staged_count))
    }

    async fn try_stage_message(
        &self,
        message: &FailedMessage,
        staging_id: StagingId,
        redirects: &MessageRedirects,
    ) -> RecoverabilityResult<()> {
        let attempt = message.last_attempt().ok_or_else(|| {
            StoreError::Storage(format!("failed message {} has no processing attempts", message.id))
        })?;

        self.messages.mark_retry_issued(&message.id).await?;

        let mut headers = remove_error_headers(&attempt.headers);
        let target = redirects.resolve(&attempt.failure_details.address_of_failing_endpoint);
        RetryHeaders {
            target_address: target,
            failed_message_id: &message.id,
            staging_id,
            attempt_message_id: &attempt.message_id,
        }
        .apply(&mut headers);
        fix_corrupted_reply_to(&mut headers, &self.local_machine_name);

        let outgoing = OutgoingMessage {
            message_id: attempt.message_id.clone(),
            headers,
            body: attempt.body.clone(),
        };
        self.transport.dispatch(outgoing, &self.staging_address).await?;

        debug!(failed_message_id = %message.id, target_address = %target, "message staged");
        Ok(())
    }

    async fn forward(&self, batch: &RetryBatch, recovering: bool) -> RecoverabilityResult<()> {
        let staging_id = batch
            .staging_id
            .ok_or_else(|| StoreError::InvalidTransition(format!("batch {} has no staging id", batch.id)))?;
        let message_count = batch.failure_retries.len();

        let forwarded = if recovering {
            info!(batch_id = %batch.id, "forwarding after premature shutdown; message count unknown");
            self.forward_staged(staging_id, None).await?;
            message_count
        } else if message_count > 0 {
            self.forward_staged(staging_id, Some(message_count)).await?
        } else {
            0
        };

        let released = self
            .store
            .release_failure_retries(batch.id, &batch.failure_retries)
            .await?;

        // Only the processor that removes the batch reports it.
        if self.store.delete_batch(batch.id).await? {
            let request_id = batch.request_id.as_ref();
            log_tracker_error(self.tracker.forwarding(request_id, batch.retry_type));
            // Staged messages that never reached the target still close out
            // the operation.
            let lost = message_count.saturating_sub(forwarded);
            if lost > 0 {
                log_tracker_error(self.tracker.skip(request_id, batch.retry_type, lost));
            }
            log_tracker_error(self.tracker.forwarded(request_id, batch.retry_type, forwarded));
        }

        info!(
            batch_id = %batch.id,
            forwarded,
            staged = message_count,
            released,
            "retry batch forwarded"
        );
        Ok(())
    }

    async fn forward_staged(
        &self,
        staging_id: StagingId,
        expected: Option<usize>,
    ) -> RecoverabilityResult<usize> {
        match self
            .transport
            .forward_staged(&self.staging_address, staging_id, expected)
            .await
        {
            Ok(forwarded) => {
                self.forwarding_breaker.success();
                Ok(forwarded)
            }
            Err(err) => {
                warn!(staging_id = %staging_id, error = %err, "forwarding staged messages failed");
                self.forwarding_breaker
                    .failure(anyhow::Error::new(err.clone()))
                    .await;
                Err(RecoverabilityError::Dispatch(err))
            }
        }
    }
}

fn forwarding_breaker(
    config: CircuitBreakerConfig,
    hooks: CircuitBreakerHooks,
) -> RepeatedFailuresCircuitBreaker {
    RepeatedFailuresCircuitBreaker::new("forwarding", config, hooks)
}

fn default_hooks() -> CircuitBreakerHooks {
    CircuitBreakerHooks::new().on_triggered(|cause| {
        error!(cause = %cause, "forwarding keeps failing; retries are not reaching their endpoints");
        Ok(())
    })
}

impl std::fmt::Debug for RetryProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryProcessor")
            .field("staging_address", &self.staging_address)
            .field("forwarding_breaker", &self.forwarding_breaker)
            .finish()
    }
}
