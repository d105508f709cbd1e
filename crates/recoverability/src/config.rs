//! Runtime configuration of the recoverability host.

use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::circuit_breaker::CircuitBreakerConfig;

/// Loop intervals, transport addresses and the forwarding breaker timings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverabilityConfig {
    /// Pause between bulk-queue drains when the queue is empty.
    pub bulk_retry_interval: Duration,
    /// Pause between processor ticks when there is nothing to stage or forward.
    pub processor_interval: Duration,
    pub orphan_adoption_interval: Duration,
    /// Queue staged messages are dispatched to before forwarding.
    pub staging_address: String,
    /// Used to repair reply-to headers that name this machine.
    pub local_machine_name: String,
    pub forwarding_breaker: CircuitBreakerConfig,
}

impl Default for RecoverabilityConfig {
    fn default() -> Self {
        Self {
            bulk_retry_interval: Duration::from_secs(5),
            processor_interval: Duration::from_secs(5),
            orphan_adoption_interval: Duration::from_secs(120),
            staging_address: "busmon.staging".to_string(),
            local_machine_name: "localhost".to_string(),
            forwarding_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl RecoverabilityConfig {
    pub fn with_bulk_retry_interval(mut self, interval: Duration) -> Self {
        self.bulk_retry_interval = interval;
        self
    }

    pub fn with_processor_interval(mut self, interval: Duration) -> Self {
        self.processor_interval = interval;
        self
    }

    pub fn with_orphan_adoption_interval(mut self, interval: Duration) -> Self {
        self.orphan_adoption_interval = interval;
        self
    }

    pub fn with_staging_address(mut self, address: impl Into<String>) -> Self {
        self.staging_address = address.into();
        self
    }

    pub fn with_local_machine_name(mut self, name: impl Into<String>) -> Self {
        self.local_machine_name = name.into();
        self
    }

    pub fn with_forwarding_breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.forwarding_breaker = breaker;
        self
    }

    /// Defaults overridden by `BUSMON_*` environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Some(secs) = secs(&lookup, "BUSMON_BULK_RETRY_INTERVAL_SECS")? {
            config.bulk_retry_interval = secs;
        }
        if let Some(secs) = secs(&lookup, "BUSMON_RETRY_PROCESSOR_INTERVAL_SECS")? {
            config.processor_interval = secs;
        }
        if let Some(secs) = secs(&lookup, "BUSMON_ORPHAN_ADOPTION_INTERVAL_SECS")? {
            config.orphan_adoption_interval = secs;
        }
        if let Some(secs) = secs(&lookup, "BUSMON_FORWARDING_BREAKER_TRIGGER_SECS")? {
            config.forwarding_breaker.time_to_wait_before_triggering = secs;
        }
        if let Some(address) = non_empty(&lookup, "BUSMON_STAGING_ADDRESS") {
            config.staging_address = address;
        }
        if let Some(machine) =
            non_empty(&lookup, "BUSMON_MACHINE_NAME").or_else(|| non_empty(&lookup, "HOSTNAME"))
        {
            config.local_machine_name = machine;
        }

        Ok(config)
    }
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn secs(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<Option<Duration>> {
    let Some(raw) = non_empty(lookup, key) else {
        return Ok(None);
    };
    let secs: u64 = raw
        .parse()
        .with_context(|| format!("{key} must be a whole number of seconds, got {raw:?}"))?;
    Ok(Some(Duration::from_secs(secs)))
}
