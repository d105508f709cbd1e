//! The retry pipeline: request gateway, orphan adoption and the batch
//! processor.

mod document_manager;
mod gateway;
mod processor;

pub use document_manager::RetryDocumentManager;
pub use gateway::{BATCH_SIZE, BulkRetryRequest, BulkRetryScope, RetriesGateway, batch_name};
pub use processor::{MAX_STAGING_ATTEMPTS, ProcessOutcome, RetryProcessor};

use crate::error::TrackerError;

/// Tracker state is best-effort; a failed update never fails the pipeline.
pub(crate) fn log_tracker_error(result: Result<(), TrackerError>) {
    if let Err(err) = result {
        tracing::warn!(error = %err, "operation tracker update failed");
    }
}
