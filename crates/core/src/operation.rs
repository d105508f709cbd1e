//! Operation kinds and lifecycle states.

use serde::{Deserialize, Serialize};

/// Scope of a retry operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryType {
    SingleMessage,
    MultipleMessages,
    FailureGroup,
    AllForEndpoint,
    ByQueueAddress,
    All,
}

impl RetryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryType::SingleMessage => "single_message",
            RetryType::MultipleMessages => "multiple_messages",
            RetryType::FailureGroup => "failure_group",
            RetryType::AllForEndpoint => "all_for_endpoint",
            RetryType::ByQueueAddress => "by_queue_address",
            RetryType::All => "all",
        }
    }
}

impl core::fmt::Display for RetryType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of an in-memory retry operation.
///
/// Waiting → Preparing → Forwarding → Completed (terminal).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryState {
    Waiting,
    Preparing,
    Forwarding,
    Completed,
}

impl RetryState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RetryState::Completed)
    }
}

/// Scope of an archive operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveType {
    FailureGroup,
    All,
}

/// Lifecycle of an in-memory archive operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveState {
    ArchiveStarted,
    ArchiveProgressing,
    ArchiveFinalizing,
    ArchiveCompleted,
}

impl ArchiveState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ArchiveState::ArchiveCompleted)
    }
}
