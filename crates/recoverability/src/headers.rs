//! Header sanitising applied to a failed message before it is redispatched.
//!
//! Everything here is pure: functions take a header map and return or
//! mutate it without touching any store.

use tracing::info;

use busmon_core::{FailedMessageId, StagingId};

use crate::failed_message::Headers;

/// Physical address the forwarder delivers a staged message to.
pub const TARGET_ENDPOINT_ADDRESS: &str = "ServiceControl.TargetEndpointAddress";
/// Failed-message id, so a successful retry can resolve the failure.
pub const RETRY_UNIQUE_MESSAGE_ID: &str = "ServiceControl.Retry.UniqueMessageId";
/// Staging id of the pass that staged the message.
pub const RETRY_STAGING_ID: &str = "ServiceControl.Retry.StagingId";
/// Wire message id of the processing attempt being retried.
pub const RETRY_ATTEMPT_MESSAGE_ID: &str = "ServiceControl.Retry.Attempt.MessageId";
/// Original reply-to value, kept when the reply-to header is repaired.
pub const OLD_REPLY_TO_ADDRESS: &str = "ServiceControl.OldReplyToAddress";

pub const REPLY_TO_ADDRESS: &str = "NServiceBus.ReplyToAddress";
pub const ORIGINATING_MACHINE: &str = "NServiceBus.OriginatingMachine";
pub const NON_DURABLE_MESSAGE: &str = "NServiceBus.NonDurableMessage";
pub const CORRELATION_ID: &str = "NServiceBus.CorrelationId";

/// Failure metadata written by the endpoint's recoverability pipeline.
const ERROR_HEADERS: &[&str] = &[
    "NServiceBus.FailedQ",
    "NServiceBus.Retries",
    "NServiceBus.FLRetries",
    "NServiceBus.Retries.Timestamp",
    "NServiceBus.TimeOfFailure",
    "NServiceBus.ProcessingFailed",
    RETRY_STAGING_ID,
    TARGET_ENDPOINT_ADDRESS,
];

const EXCEPTION_INFO_PREFIX: &str = "NServiceBus.ExceptionInfo.";

fn is_error_header(key: &str) -> bool {
    key.starts_with(EXCEPTION_INFO_PREFIX) || ERROR_HEADERS.contains(&key)
}

/// Copy of `headers` without stale failure/retry metadata.
///
/// Durability and correlation headers pass through untouched.
pub fn remove_error_headers(headers: &Headers) -> Headers {
    headers
        .iter()
        .filter(|(key, _)| !is_error_header(key))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Correlation headers stamped on every staged message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryHeaders<'a> {
    pub target_address: &'a str,
    pub failed_message_id: &'a FailedMessageId,
    pub staging_id: StagingId,
    pub attempt_message_id: &'a str,
}

impl RetryHeaders<'_> {
    pub fn apply(&self, headers: &mut Headers) {
        headers.insert(TARGET_ENDPOINT_ADDRESS.to_string(), self.target_address.to_string());
        headers.insert(
            RETRY_UNIQUE_MESSAGE_ID.to_string(),
            self.failed_message_id.to_string(),
        );
        headers.insert(RETRY_STAGING_ID.to_string(), self.staging_id.to_string());
        headers.insert(
            RETRY_ATTEMPT_MESSAGE_ID.to_string(),
            self.attempt_message_id.to_string(),
        );
    }
}

/// Repair a reply-to address that names this machine instead of the
/// machine the message originated from.
///
/// Applies only to `queue@machine` addresses where `machine` is the local
/// machine and the originating machine differs. The old value is kept under
/// [`OLD_REPLY_TO_ADDRESS`]. Returns true when the header was rewritten.
pub fn fix_corrupted_reply_to(headers: &mut Headers, local_machine: &str) -> bool {
    let Some(reply_to) = headers.get(REPLY_TO_ADDRESS) else {
        return false;
    };
    let Some(originating_machine) = headers.get(ORIGINATING_MACHINE) else {
        return false;
    };

    let mut parts = reply_to.split('@');
    let (Some(queue), Some(machine), None) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };

    if !machine.eq_ignore_ascii_case(local_machine)
        || originating_machine.eq_ignore_ascii_case(local_machine)
    {
        return false;
    }

    let fixed = format!("{queue}@{originating_machine}");
    let old = reply_to.clone();
    info!(old = %old, fixed = %fixed, "repairing corrupted reply-to header");

    headers.insert(OLD_REPLY_TO_ADDRESS.to_string(), old);
    headers.insert(REPLY_TO_ADDRESS.to_string(), fixed);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn strips_failure_metadata_and_keeps_the_rest() {
        let original = headers(&[
            ("NServiceBus.FailedQ", "sales@box"),
            ("NServiceBus.TimeOfFailure", "2024-01-01"),
            ("NServiceBus.ExceptionInfo.StackTrace", "at ..."),
            ("NServiceBus.ExceptionInfo.Message", "boom"),
            (RETRY_STAGING_ID, "old-staging"),
            (NON_DURABLE_MESSAGE, "True"),
            (CORRELATION_ID, "corr-1"),
            ("NServiceBus.EnclosedMessageTypes", "Sales.PlaceOrder"),
        ]);

        let cleaned = remove_error_headers(&original);

        assert_eq!(cleaned.len(), 3);
        assert_eq!(cleaned.get(NON_DURABLE_MESSAGE).map(String::as_str), Some("True"));
        assert_eq!(cleaned.get(CORRELATION_ID).map(String::as_str), Some("corr-1"));
        assert!(cleaned.contains_key("NServiceBus.EnclosedMessageTypes"));
    }

    #[test]
    fn stamps_correlation_headers() {
        let id = FailedMessageId::new("msg-1").unwrap();
        let staging_id = StagingId::new();
        let mut h = Headers::new();

        RetryHeaders {
            target_address: "sales@box",
            failed_message_id: &id,
            staging_id,
            attempt_message_id: "wire-1",
        }
        .apply(&mut h);

        assert_eq!(h[TARGET_ENDPOINT_ADDRESS], "sales@box");
        assert_eq!(h[RETRY_UNIQUE_MESSAGE_ID], "msg-1");
        assert_eq!(h[RETRY_STAGING_ID], staging_id.to_string());
        assert_eq!(h[RETRY_ATTEMPT_MESSAGE_ID], "wire-1");
    }

    #[test]
    fn repairs_reply_to_pointing_at_local_machine() {
        let mut h = headers(&[
            (REPLY_TO_ADDRESS, "sales@MONITOR"),
            (ORIGINATING_MACHINE, "web-01"),
        ]);

        assert!(fix_corrupted_reply_to(&mut h, "monitor"));
        assert_eq!(h[REPLY_TO_ADDRESS], "sales@web-01");
        assert_eq!(h[OLD_REPLY_TO_ADDRESS], "sales@MONITOR");
    }

    #[test]
    fn leaves_healthy_reply_to_alone() {
        let cases = [
            headers(&[(REPLY_TO_ADDRESS, "sales@web-01"), (ORIGINATING_MACHINE, "web-01")]),
            headers(&[(REPLY_TO_ADDRESS, "sales@monitor"), (ORIGINATING_MACHINE, "monitor")]),
            headers(&[(REPLY_TO_ADDRESS, "sales"), (ORIGINATING_MACHINE, "web-01")]),
            headers(&[(REPLY_TO_ADDRESS, "sales@monitor")]),
        ];

        for mut h in cases {
            let before = h.clone();
            assert!(!fix_corrupted_reply_to(&mut h, "monitor"));
            assert_eq!(h, before);
        }
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        fn any_key() -> impl Strategy<Value = String> {
            prop_oneof![
                Just("NServiceBus.FailedQ".to_string()),
                Just(RETRY_STAGING_ID.to_string()),
                Just(TARGET_ENDPOINT_ADDRESS.to_string()),
                "[a-z]{1,8}".prop_map(|s| format!("NServiceBus.ExceptionInfo.{s}")),
                "[A-Za-z.]{1,20}",
            ]
        }

        proptest! {
            /// Property: sanitising drops exactly the failure metadata.
            #[test]
            fn removes_only_error_headers(
                pairs in proptest::collection::vec((any_key(), "[a-z0-9]{0,6}"), 0..24),
            ) {
                let original: Headers = pairs.into_iter().collect();
                let cleaned = remove_error_headers(&original);

                for (key, value) in &original {
                    prop_assert_eq!(cleaned.get(key) == Some(value), !is_error_header(key));
                }
                prop_assert!(cleaned.keys().all(|k| original.contains_key(k)));
            }
        }
    }
}
