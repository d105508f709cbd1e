//! Read/mark access to the failure store the retry pipeline draws from.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use futures::stream::{self, BoxStream, StreamExt};

use busmon_core::FailedMessageId;

use super::batch_store::StoreError;
use crate::failed_message::{
    FailedMessage, FailedMessageFilter, FailedMessageStatus, MatchedFailure, MessageRedirects,
};

/// Failure store abstraction.
#[async_trait::async_trait]
pub trait FailedMessageStore: Send + Sync {
    /// Stream the ids of unresolved messages matching `filter`.
    ///
    /// Large selections are consumed lazily; callers must not assume the
    /// whole result fits in memory.
    fn stream_matching(
        &self,
        filter: FailedMessageFilter,
    ) -> BoxStream<'_, Result<MatchedFailure, StoreError>>;

    /// Missing ids are skipped.
    async fn load_messages(
        &self,
        ids: &[FailedMessageId],
    ) -> Result<Vec<FailedMessage>, StoreError>;

    async fn mark_retry_issued(&self, id: &FailedMessageId) -> Result<(), StoreError>;

    async fn message_redirects(&self) -> Result<MessageRedirects, StoreError>;
}

/// In-memory failure store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryFailedMessageStore {
    // Keyed by normalized id.
    messages: RwLock<BTreeMap<String, FailedMessage>>,
    redirects: RwLock<MessageRedirects>,
}

impl InMemoryFailedMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn insert(&self, message: FailedMessage) -> Result<(), StoreError> {
        let mut messages = self.messages.write().map_err(|_| StoreError::Poisoned)?;
        messages.insert(message.id.normalized(), message);
        Ok(())
    }

    pub fn get(&self, id: &FailedMessageId) -> Option<FailedMessage> {
        self.messages.read().ok()?.get(&id.normalized()).cloned()
    }

    pub fn set_redirects(&self, redirects: MessageRedirects) -> Result<(), StoreError> {
        *self.redirects.write().map_err(|_| StoreError::Poisoned)? = redirects;
        Ok(())
    }

    pub fn count_with_status(&self, status: FailedMessageStatus) -> usize {
        self.messages
            .read()
            .map(|m| m.values().filter(|msg| msg.status == status).count())
            .unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl FailedMessageStore for InMemoryFailedMessageStore {
    fn stream_matching(
        &self,
        filter: FailedMessageFilter,
    ) -> BoxStream<'_, Result<MatchedFailure, StoreError>> {
        let snapshot: Vec<Result<MatchedFailure, StoreError>> = match self.messages.read() {
            Ok(messages) => messages
                .values()
                .filter(|m| m.matches(&filter))
                .filter_map(|m| {
                    m.time_of_failure().map(|time_of_failure| {
                        Ok(MatchedFailure {
                            id: m.id.clone(),
                            time_of_failure,
                        })
                    })
                })
                .collect(),
            Err(_) => vec![Err(StoreError::Poisoned)],
        };
        stream::iter(snapshot).boxed()
    }

    async fn load_messages(
        &self,
        ids: &[FailedMessageId],
    ) -> Result<Vec<FailedMessage>, StoreError> {
        let messages = self.messages.read().map_err(|_| StoreError::Poisoned)?;
        Ok(ids
            .iter()
            .filter_map(|id| messages.get(&id.normalized()).cloned())
            .collect())
    }

    async fn mark_retry_issued(&self, id: &FailedMessageId) -> Result<(), StoreError> {
        let mut messages = self.messages.write().map_err(|_| StoreError::Poisoned)?;
        let message = messages
            .get_mut(&id.normalized())
            .ok_or_else(|| StoreError::MessageNotFound(id.clone()))?;
        message.status = FailedMessageStatus::RetryIssued;
        Ok(())
    }

    async fn message_redirects(&self) -> Result<MessageRedirects, StoreError> {
        Ok(self.redirects.read().map_err(|_| StoreError::Poisoned)?.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failed_message::{ExceptionDetails, FailureDetails, Headers, ProcessingAttempt};
    use chrono::Utc;
    use futures::TryStreamExt;

    fn failed(id: &str, endpoint: &str) -> FailedMessage {
        FailedMessage {
            id: FailedMessageId::new(id).unwrap(),
            status: FailedMessageStatus::Unresolved,
            processing_attempts: vec![ProcessingAttempt {
                message_id: format!("wire-{id}"),
                receiving_endpoint: Some(endpoint.to_string()),
                headers: Headers::new(),
                body: b"{}".to_vec(),
                failure_details: FailureDetails {
                    address_of_failing_endpoint: format!("{endpoint}@machine"),
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

    #[tokio::test]
    async fn streams_only_matching_unresolved_messages() {
        let store = InMemoryFailedMessageStore::new();
        store.insert(failed("a", "Sales")).unwrap();
        store.insert(failed("b", "Sales")).unwrap();
        store.insert(failed("c", "Billing")).unwrap();
        store
            .mark_retry_issued(&FailedMessageId::new("b").unwrap())
            .await
            .unwrap();

        let matched: Vec<_> = store
            .stream_matching(FailedMessageFilter::Endpoint("Sales".to_string()))
            .try_collect()
            .await
            .unwrap();

        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].id.as_str(), "a");
        assert_eq!(store.count_with_status(FailedMessageStatus::RetryIssued), 1);
    }

    #[tokio::test]
    async fn load_skips_missing_ids() {
        let store = InMemoryFailedMessageStore::new();
        store.insert(failed("a", "Sales")).unwrap();

        let ids = vec![FailedMessageId::new("A").unwrap(), FailedMessageId::new("zz").unwrap()];
        let loaded = store.load_messages(&ids).await.unwrap();
        assert_eq!(loaded.len(), 1);

        assert!(matches!(
            store.mark_retry_issued(&FailedMessageId::new("zz").unwrap()).await,
            Err(StoreError::MessageNotFound(_))
        ));
    }
}
