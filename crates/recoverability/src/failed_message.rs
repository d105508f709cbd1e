//! Failed-message records as exposed by the failure store.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use busmon_core::FailedMessageId;

/// Message headers, as captured on the failed processing attempt.
pub type Headers = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailedMessageStatus {
    Unresolved,
    RetryIssued,
    Resolved,
    Archived,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionDetails {
    pub exception_type: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetails {
    /// Physical address of the endpoint whose processing failed.
    pub address_of_failing_endpoint: String,
    pub time_of_failure: DateTime<Utc>,
    pub exception: ExceptionDetails,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingAttempt {
    /// Wire message id of this attempt.
    pub message_id: String,
    pub receiving_endpoint: Option<String>,
    pub headers: Headers,
    pub body: Vec<u8>,
    pub failure_details: FailureDetails,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureGroup {
    pub id: String,
    pub title: String,
    pub group_type: String,
}

/// A failed message with every recorded processing attempt (oldest first).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedMessage {
    pub id: FailedMessageId,
    pub status: FailedMessageStatus,
    pub processing_attempts: Vec<ProcessingAttempt>,
    pub failure_groups: Vec<FailureGroup>,
}

impl FailedMessage {
    pub fn last_attempt(&self) -> Option<&ProcessingAttempt> {
        self.processing_attempts.last()
    }

    pub fn time_of_failure(&self) -> Option<DateTime<Utc>> {
        self.last_attempt().map(|a| a.failure_details.time_of_failure)
    }

    pub fn matches(&self, filter: &FailedMessageFilter) -> bool {
        if self.status != FailedMessageStatus::Unresolved {
            return false;
        }
        let last = self.last_attempt();
        match filter {
            FailedMessageFilter::All => true,
            FailedMessageFilter::Endpoint(name) => last
                .and_then(|a| a.receiving_endpoint.as_deref())
                .is_some_and(|e| e.eq_ignore_ascii_case(name)),
            FailedMessageFilter::FailureGroup(group_id) => {
                self.failure_groups.iter().any(|g| &g.id == group_id)
            }
            FailedMessageFilter::QueueAddress(address) => last
                .is_some_and(|a| a.failure_details.address_of_failing_endpoint.eq_ignore_ascii_case(address)),
        }
    }
}

/// Selection of unresolved failed messages for a bulk retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailedMessageFilter {
    All,
    Endpoint(String),
    FailureGroup(String),
    QueueAddress(String),
}

/// One id yielded by a bulk enumeration, with its original failure time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedFailure {
    pub id: FailedMessageId,
    pub time_of_failure: DateTime<Utc>,
}

/// Address redirect table: failing physical address → replacement address.
/// Lookups ignore case.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRedirects {
    redirects: HashMap<String, String>,
}

impl MessageRedirects {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_redirect(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.insert(from, to);
        self
    }

    pub fn insert(&mut self, from: impl Into<String>, to: impl Into<String>) {
        self.redirects.insert(from.into().to_lowercase(), to.into());
    }

    /// The address to send to: the redirect target if one exists, else `address`.
    pub fn resolve<'a>(&'a self, address: &'a str) -> &'a str {
        self.redirects
            .get(&address.to_lowercase())
            .map(String::as_str)
            .unwrap_or(address)
    }

    pub fn is_empty(&self) -> bool {
        self.redirects.is_empty()
    }
}
