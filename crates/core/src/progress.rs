//! Completion percentage for retry and archive operations.
//!
//! Pure functions: the tracker calls these to build status snapshots.
//! A zero total always yields `0.0`; the result never exceeds `1.0`.

use crate::operation::{ArchiveState, RetryState};

/// Completion of a retry operation in `[0.0, 1.0]`.
///
/// - Preparing: `prepared / total`
/// - Forwarding: `(forwarded + skipped) / total`
/// - Completed: `1.0`
/// - Waiting: `0.0`
pub fn retry_percentage(
    total: usize,
    prepared: usize,
    forwarded: usize,
    skipped: usize,
    state: RetryState,
) -> f64 {
    match state {
        RetryState::Preparing => ratio(prepared, total),
        RetryState::Forwarding => ratio(forwarded.saturating_add(skipped), total),
        RetryState::Completed => 1.0,
        RetryState::Waiting => 0.0,
    }
}

/// Completion of an archive operation in `[0.0, 1.0]`.
pub fn archive_percentage(total: usize, archived: usize, state: ArchiveState) -> f64 {
    match state {
        ArchiveState::ArchiveStarted => 0.0,
        ArchiveState::ArchiveProgressing => ratio(archived, total),
        ArchiveState::ArchiveFinalizing | ArchiveState::ArchiveCompleted => 1.0,
    }
}

fn ratio(done: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (done as f64 / total as f64).min(1.0)
}
