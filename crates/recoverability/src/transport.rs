//! Transport seam: dispatch of staged messages and forwarding out of the
//! staging queue.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use busmon_core::StagingId;

use crate::failed_message::Headers;
use crate::headers::{RETRY_STAGING_ID, TARGET_ENDPOINT_ADDRESS};

/// A message ready to be put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub message_id: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    #[error("dispatch of message {message_id} to {destination} failed: {reason}")]
    Rejected {
        message_id: String,
        destination: String,
        reason: String,
    },
    #[error("forwarding from {queue} failed: {reason}")]
    Forward { queue: String, reason: String },
    #[error("transport lock poisoned")]
    Poisoned,
}

/// Transport dispatcher abstraction.
#[async_trait::async_trait]
pub trait TransportDispatcher: Send + Sync {
    /// Fire-and-acknowledge send. Headers must reach the destination intact.
    async fn dispatch(
        &self,
        message: OutgoingMessage,
        destination: &str,
    ) -> Result<(), DispatchError>;

    /// Move the messages staged under `staging_id` from `staging_queue` to
    /// the address in their target header.
    ///
    /// `expected` is the number of messages the batch staged; `None` means the
    /// count is unknown and the queue is drained. Returns the number of
    /// messages forwarded.
    async fn forward_staged(
        &self,
        staging_queue: &str,
        staging_id: StagingId,
        expected: Option<usize>,
    ) -> Result<usize, DispatchError>;
}

#[derive(Debug, Default)]
struct Wire {
    queues: HashMap<String, VecDeque<OutgoingMessage>>,
    // Remaining injected failures per message id.
    dispatch_faults: HashMap<String, u32>,
    forward_faults: u32,
    // Expected count of every forwarding pass, failed ones included.
    forward_requests: Vec<Option<usize>>,
}

/// In-memory transport for tests/dev: named FIFO queues plus fault injection.
#[derive(Debug, Default)]
pub struct InMemoryTransport {
    wire: Mutex<Wire>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn wire(&self) -> Result<MutexGuard<'_, Wire>, DispatchError> {
        self.wire.lock().map_err(|_| DispatchError::Poisoned)
    }

    /// Make the next `times` dispatches of `message_id` fail.
    pub fn fail_dispatch(&self, message_id: impl Into<String>, times: u32) {
        if let Ok(mut wire) = self.wire() {
            wire.dispatch_faults.insert(message_id.into(), times);
        }
    }

    /// Make the next `times` forwarding passes fail.
    pub fn fail_forwarding(&self, times: u32) {
        if let Ok(mut wire) = self.wire() {
            wire.forward_faults = times;
        }
    }

    /// Snapshot of a queue, front first.
    pub fn messages_in(&self, queue: &str) -> Vec<OutgoingMessage> {
        self.wire()
            .ok()
            .and_then(|w| w.queues.get(queue).map(|q| q.iter().cloned().collect()))
            .unwrap_or_default()
    }

    /// Expected counts passed to `forward_staged`, oldest first.
    pub fn forward_requests(&self) -> Vec<Option<usize>> {
        self.wire()
            .map(|w| w.forward_requests.clone())
            .unwrap_or_default()
    }

    pub fn queue_len(&self, queue: &str) -> usize {
        self.wire()
            .ok()
            .and_then(|w| w.queues.get(queue).map(VecDeque::len))
            .unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl TransportDispatcher for InMemoryTransport {
    async fn dispatch(
        &self,
        message: OutgoingMessage,
        destination: &str,
    ) -> Result<(), DispatchError> {
        let mut wire = self.wire()?;

        if let Some(remaining) = wire.dispatch_faults.get_mut(&message.message_id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(DispatchError::Rejected {
                    message_id: message.message_id,
                    destination: destination.to_string(),
                    reason: "injected fault".to_string(),
                });
            }
        }

        wire.queues
            .entry(destination.to_string())
            .or_default()
            .push_back(message);
        Ok(())
    }

    async fn forward_staged(
        &self,
        staging_queue: &str,
        staging_id: StagingId,
        expected: Option<usize>,
    ) -> Result<usize, DispatchError> {
        let mut wire = self.wire()?;
        wire.forward_requests.push(expected);

        if wire.forward_faults > 0 {
            wire.forward_faults -= 1;
            return Err(DispatchError::Forward {
                queue: staging_queue.to_string(),
                reason: "injected fault".to_string(),
            });
        }

        let staging_id = staging_id.to_string();
        let mut pending = wire.queues.remove(staging_queue).unwrap_or_default();
        let mut forwarded = 0;

        while expected.is_none_or(|n| forwarded < n) {
            let Some(mut message) = pending.pop_front() else {
                break;
            };

            if message.headers.get(RETRY_STAGING_ID) != Some(&staging_id) {
                debug!(message_id = %message.message_id, "discarding message from a stale staging pass");
                continue;
            }

            message.headers.remove(RETRY_STAGING_ID);
            let Some(target) = message.headers.remove(TARGET_ENDPOINT_ADDRESS) else {
                warn!(message_id = %message.message_id, "staged message has no target address; discarding");
                continue;
            };

            wire.queues.entry(target).or_default().push_back(message);
            forwarded += 1;
        }

        if !pending.is_empty() {
            wire.queues.insert(staging_queue.to_string(), pending);
        }

        if let Some(n) = expected {
            if forwarded < n {
                warn!(expected = n, forwarded, queue = staging_queue, "staging queue ran dry before the expected count");
            }
        }

        Ok(forwarded)
    }
}
