//! `busmon-recoverability` — retry orchestration for failed bus messages.
//!
//! Retry requests become durable batches ([`documents::RetryBatch`]) that the
//! [`retries::RetryProcessor`] stages and forwards one at a time. Batches
//! survive restarts; [`retries::RetryDocumentManager`] adopts the ones an
//! earlier session abandoned. Progress is tracked in memory by
//! [`operations::RetryingManager`] and published as notifications.

pub mod circuit_breaker;
pub mod config;
pub mod documents;
pub mod error;
pub mod failed_message;
pub mod headers;
pub mod host;
pub mod operations;
pub mod retries;
pub mod scheduler;
pub mod store;
pub mod transport;

pub use circuit_breaker::{
    BreakerState, CircuitBreakerConfig, CircuitBreakerHooks, RepeatedFailuresCircuitBreaker,
};
pub use config::RecoverabilityConfig;
pub use error::{RecoverabilityError, RecoverabilityResult, TrackerError};
pub use host::{Collaborators, RecoverabilityHost};
pub use retries::{ProcessOutcome, RetriesGateway, RetryDocumentManager, RetryProcessor};
pub use scheduler::{CancellationSignal, TimerJob, TimerJobExecutionResult, TimerScheduler};
