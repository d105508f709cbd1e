//! Repeated-failures circuit breaker.
//!
//! Disarmed → Armed on the first failure; Armed → Triggered when failures
//! keep coming for `time_to_wait_before_triggering`; any success disarms.
//! Every failure hands back a delay the caller should await before retrying,
//! longer once the breaker has triggered.
//!
//! State changes and hooks run while the breaker's state lock is held. Hooks
//! must not block or perform long I/O. Hook errors are logged and never
//! propagate.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Sleep;
use tracing::{error, info, warn};

pub type BreakerHook = Box<dyn Fn() -> anyhow::Result<()> + Send + Sync>;
pub type TriggerHook = Box<dyn Fn(&anyhow::Error) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BreakerState {
    #[default]
    Disarmed,
    Armed,
    Triggered,
}

/// Circuit breaker timings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// How long failures must persist before the breaker triggers.
    pub time_to_wait_before_triggering: Duration,
    /// Delay handed back per failure while armed.
    pub time_to_wait_when_armed: Duration,
    /// Delay handed back per failure once triggered.
    pub time_to_wait_when_triggered: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            time_to_wait_before_triggering: Duration::from_secs(120),
            time_to_wait_when_armed: Duration::from_secs(1),
            time_to_wait_when_triggered: Duration::from_secs(10),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_time_to_wait_before_triggering(mut self, wait: Duration) -> Self {
        self.time_to_wait_before_triggering = wait;
        self
    }

    pub fn with_time_to_wait_when_armed(mut self, wait: Duration) -> Self {
        self.time_to_wait_when_armed = wait;
        self
    }

    pub fn with_time_to_wait_when_triggered(mut self, wait: Duration) -> Self {
        self.time_to_wait_when_triggered = wait;
        self
    }
}

/// State-change callbacks. Missing hooks are no-ops.
#[derive(Default)]
pub struct CircuitBreakerHooks {
    on_armed: Option<BreakerHook>,
    on_disarmed: Option<BreakerHook>,
    on_triggered: Option<TriggerHook>,
}

impl CircuitBreakerHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_armed<F>(mut self, hook: F) -> Self
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_armed = Some(Box::new(hook));
        self
    }

    pub fn on_disarmed<F>(mut self, hook: F) -> Self
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_disarmed = Some(Box::new(hook));
        self
    }

    /// Called once per arm/trigger cycle with the most recent failure.
    pub fn on_triggered<F>(mut self, hook: F) -> Self
    where
        F: Fn(&anyhow::Error) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_triggered = Some(Box::new(hook));
        self
    }
}

impl std::fmt::Debug for CircuitBreakerHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerHooks")
            .field("on_armed", &self.on_armed.is_some())
            .field("on_disarmed", &self.on_disarmed.is_some())
            .field("on_triggered", &self.on_triggered.is_some())
            .finish()
    }
}

#[derive(Default)]
struct Guarded {
    state: BreakerState,
    // Bumped on every arm; a timer only fires for the arm that spawned it.
    generation: u64,
    timer: Option<JoinHandle<()>>,
    last_failure: Option<anyhow::Error>,
}

struct Inner {
    name: String,
    config: CircuitBreakerConfig,
    guarded: Mutex<Guarded>,
    hooks: CircuitBreakerHooks,
}

impl Inner {
    fn guarded(&self) -> MutexGuard<'_, Guarded> {
        self.guarded.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn trigger(&self, generation: u64) {
        let mut guarded = self.guarded();
        if guarded.state != BreakerState::Armed || guarded.generation != generation {
            return;
        }
        guarded.state = BreakerState::Triggered;
        guarded.timer = None;

        let Some(cause) = guarded.last_failure.as_ref() else {
            return;
        };
        warn!(breaker = %self.name, cause = %cause, "circuit breaker triggered");
        if let Some(hook) = &self.hooks.on_triggered {
            if let Err(err) = hook(cause) {
                error!(breaker = %self.name, error = %err, cause = %cause, "circuit breaker trigger hook failed");
            }
        }
    }

    fn run_hook(&self, hook: Option<&BreakerHook>, what: &str, cause: Option<&anyhow::Error>) {
        let Some(hook) = hook else {
            return;
        };
        if let Err(err) = hook() {
            match cause {
                Some(cause) => {
                    error!(breaker = %self.name, hook = what, error = %err, cause = %cause, "circuit breaker hook failed")
                }
                None => error!(breaker = %self.name, hook = what, error = %err, "circuit breaker hook failed"),
            }
        }
    }
}

/// Circuit breaker guarding a repeatedly failing operation.
///
/// Must be used from within a tokio runtime: arming spawns the trigger timer.
/// Dropping the breaker cancels a pending timer.
pub struct RepeatedFailuresCircuitBreaker {
    inner: Arc<Inner>,
}

impl RepeatedFailuresCircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        hooks: CircuitBreakerHooks,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                config,
                guarded: Mutex::new(Guarded::default()),
                hooks,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> CircuitBreakerConfig {
        self.inner.config
    }

    pub fn state(&self) -> BreakerState {
        self.inner.guarded().state
    }

    /// Disarm. No-op when already disarmed.
    pub fn success(&self) {
        let mut guarded = self.inner.guarded();
        if guarded.state == BreakerState::Disarmed {
            return;
        }

        guarded.state = BreakerState::Disarmed;
        if let Some(timer) = guarded.timer.take() {
            timer.abort();
        }
        guarded.last_failure = None;
        info!(breaker = %self.inner.name, "circuit breaker disarmed");
        self.inner.run_hook(self.inner.hooks.on_disarmed.as_ref(), "disarmed", None);
    }

    /// Record a failure and return the delay to await before retrying.
    pub fn failure(&self, error: anyhow::Error) -> Sleep {
        let inner = &self.inner;

        let previous = {
            let mut guarded = inner.guarded();
            let previous = guarded.state;
            if previous == BreakerState::Disarmed {
                guarded.state = BreakerState::Armed;
                guarded.generation += 1;
                warn!(
                    breaker = %inner.name,
                    error = %error,
                    trigger_after_ms = inner.config.time_to_wait_before_triggering.as_millis() as u64,
                    "circuit breaker armed"
                );
                if let Some(timer) = guarded.timer.take() {
                    timer.abort();
                }
                guarded.timer = Some(spawn_trigger_timer(
                    Arc::downgrade(inner),
                    guarded.generation,
                    inner.config.time_to_wait_before_triggering,
                ));
                inner.run_hook(inner.hooks.on_armed.as_ref(), "armed", Some(&error));
            }
            guarded.last_failure = Some(error);
            previous
        };

        let delay = if previous == BreakerState::Triggered {
            inner.config.time_to_wait_when_triggered
        } else {
            inner.config.time_to_wait_when_armed
        };
        tokio::time::sleep(delay)
    }
}

fn spawn_trigger_timer(inner: Weak<Inner>, generation: u64, after: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        if let Some(inner) = inner.upgrade() {
            inner.trigger(generation);
        }
    })
}

impl Drop for RepeatedFailuresCircuitBreaker {
    fn drop(&mut self) {
        if let Some(timer) = self.inner.guarded().timer.take() {
            timer.abort();
        }
    }
}

impl std::fmt::Debug for RepeatedFailuresCircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepeatedFailuresCircuitBreaker")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .field("config", &self.inner.config)
            .finish()
    }
}
