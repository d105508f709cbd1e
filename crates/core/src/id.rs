//! Strongly-typed identifiers used across the recoverability engine.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Identifier of a durable retry batch.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RetryBatchId(Uuid);

/// Identifier of one process incarnation. A batch whose session differs from
/// the current one was created by a previous run.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

/// Correlation id minted at staging time and stamped on every staged message.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StagingId(Uuid);

macro_rules! impl_uuid_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Create a new identifier.
            ///
            /// Uses UUIDv7 (time-ordered). Prefer passing IDs explicitly in tests
            /// for determinism.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $t {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$t> for Uuid {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = Uuid::from_str(s)
                    .map_err(|e| DomainError::invalid_id(format!("{}: {}", $name, e)))?;
                Ok(Self(uuid))
            }
        }
    };
}

impl_uuid_newtype!(RetryBatchId, "RetryBatchId");
impl_uuid_newtype!(SessionId, "SessionId");
impl_uuid_newtype!(StagingId, "StagingId");

macro_rules! impl_string_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            pub fn new(value: impl Into<String>) -> Result<Self, DomainError> {
                let value = value.into();
                if value.trim().is_empty() {
                    return Err(DomainError::invalid_id(format!("{}: empty", $name)));
                }
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

/// Unique id of a failed message as recorded by the failure store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FailedMessageId(String);

/// Logical identity of a retry or archive operation (endpoint name, group id,
/// queue address, ...). Operations are keyed by request id plus type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl_string_newtype!(FailedMessageId, "FailedMessageId");
impl_string_newtype!(RequestId, "RequestId");

impl FailedMessageId {
    /// Case-folded form used for identity comparisons.
    pub fn normalized(&self) -> String {
        self.0.to_lowercase()
    }
}

impl RequestId {
    /// A fresh request id for operations without a natural identity
    /// (message selections).
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }
}

/// Id of the per-message retry marker.
///
/// Derived deterministically from the failed message id, so a message can
/// have at most one outstanding marker. Ids that differ only in case map to
/// the same marker.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FailedMessageRetryId(Uuid);

const FAILED_MESSAGE_RETRY_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a0e_8d3b_4c55_9a71_3e0b_5d2f_c4a8);

impl FailedMessageRetryId {
    pub fn for_message(message_id: &FailedMessageId) -> Self {
        Self(Uuid::new_v5(
            &FAILED_MESSAGE_RETRY_NAMESPACE,
            message_id.normalized().as_bytes(),
        ))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl core::fmt::Display for FailedMessageRetryId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "FailedMessageRetries/{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_id_is_deterministic_and_case_insensitive() {
        let a = FailedMessageId::new("Msg-42").unwrap();
        let b = FailedMessageId::new("msg-42").unwrap();
        let c = FailedMessageId::new("msg-43").unwrap();

        assert_eq!(
            FailedMessageRetryId::for_message(&a),
            FailedMessageRetryId::for_message(&a)
        );
        assert_eq!(
            FailedMessageRetryId::for_message(&a),
            FailedMessageRetryId::for_message(&b)
        );
        assert_ne!(
            FailedMessageRetryId::for_message(&a),
            FailedMessageRetryId::for_message(&c)
        );
    }

    #[test]
    fn empty_string_ids_are_rejected() {
        assert!(FailedMessageId::new("  ").is_err());
        assert!(RequestId::new("").is_err());
        assert!("Sales".parse::<RequestId>().is_ok());
    }

    #[test]
    fn uuid_ids_round_trip_through_display() {
        let id = RetryBatchId::new();
        let parsed: RetryBatchId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!(matches!(
            "not-a-uuid".parse::<SessionId>(),
            Err(DomainError::InvalidId(_))
        ));
    }
}
