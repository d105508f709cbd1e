//! Periodic timer jobs with cooperative cancellation.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// What a timer job wants after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerJobExecutionResult {
    /// Sleep for the job's interval, then tick again.
    ScheduleNextExecution,
    /// There is more work; tick again right away.
    ExecuteImmediately,
    /// Stop the job.
    DoNotContinueExecuting,
}

/// Cancellation signal handed to each tick.
///
/// Callbacks may poll it to return early; the scheduler never interrupts a
/// running callback.
#[derive(Debug, Clone)]
pub struct CancellationSignal {
    rx: Option<watch::Receiver<bool>>,
}

impl CancellationSignal {
    /// A signal that is never raised.
    pub fn never() -> Self {
        Self { rx: None }
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolves once cancellation is requested or the owning job is dropped.
    pub async fn cancelled(&mut self) {
        match self.rx.as_mut() {
            Some(rx) => {
                let _ = rx.wait_for(|stop| *stop).await;
            }
            None => std::future::pending().await,
        }
    }
}

/// Handle to a running timer job.
#[derive(Debug)]
pub struct TimerJob {
    name: String,
    stop: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl TimerJob {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Cancel any pending wait and wait for an in-flight tick to finish.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(err) = self.join.await {
            if err.is_panic() {
                error!(job = %self.name, "timer job panicked");
            }
        }
    }
}

/// Spawns timer jobs on the current tokio runtime.
#[derive(Debug, Clone, Default)]
pub struct TimerScheduler;

impl TimerScheduler {
    pub fn new() -> Self {
        Self
    }

    /// Run `callback` after `due`, then as its result dictates.
    ///
    /// Errors go to `error_handler` and the next tick is scheduled after
    /// `interval`; a failing tick never ends the job.
    pub fn schedule<F, Fut, E>(
        &self,
        name: impl Into<String>,
        mut callback: F,
        due: Duration,
        interval: Duration,
        error_handler: E,
    ) -> TimerJob
    where
        F: FnMut(CancellationSignal) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<TimerJobExecutionResult>> + Send + 'static,
        E: Fn(&anyhow::Error) + Send + Sync + 'static,
    {
        let name = name.into();
        let (stop, mut rx) = watch::channel(false);
        let job_name = name.clone();

        let join = tokio::spawn(async move {
            info!(job = %job_name, "timer job started");

            if wait(due, &mut rx).await {
                loop {
                    let signal = CancellationSignal { rx: Some(rx.clone()) };
                    let next = match callback(signal).await {
                        Ok(next) => next,
                        Err(err) => {
                            error_handler(&err);
                            TimerJobExecutionResult::ScheduleNextExecution
                        }
                    };

                    if *rx.borrow() {
                        break;
                    }

                    match next {
                        TimerJobExecutionResult::ExecuteImmediately => {
                            debug!(job = %job_name, "timer job executing again immediately");
                            tokio::task::yield_now().await;
                        }
                        TimerJobExecutionResult::DoNotContinueExecuting => break,
                        TimerJobExecutionResult::ScheduleNextExecution => {
                            if !wait(interval, &mut rx).await {
                                break;
                            }
                        }
                    }
                }
            }

            info!(job = %job_name, "timer job stopped");
        });

        TimerJob { name, stop, join }
    }
}

/// Sleep for `duration`. Returns false if cancelled first.
async fn wait(duration: Duration, rx: &mut watch::Receiver<bool>) -> bool {
    if *rx.borrow() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = rx.changed() => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn ignore(_: &anyhow::Error) {}

    #[tokio::test(start_paused = true)]
    async fn ticks_after_due_then_every_interval() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();

        let job = TimerScheduler::new().schedule(
            "interval",
            move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(TimerJobExecutionResult::ScheduleNextExecution)
                }
            },
            Duration::from_secs(1),
            Duration::from_secs(10),
            ignore,
        );

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        job.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn execute_immediately_skips_the_interval() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();

        let job = TimerScheduler::new().schedule(
            "drain",
            move |_| {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    Ok(if n < 4 {
                        TimerJobExecutionResult::ExecuteImmediately
                    } else {
                        TimerJobExecutionResult::ScheduleNextExecution
                    })
                }
            },
            Duration::ZERO,
            Duration::from_secs(60),
            ignore,
        );

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 4);
        job.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn errors_are_handled_and_do_not_stop_the_job() {
        let errors = Arc::new(AtomicUsize::new(0));
        let seen = errors.clone();

        let job = TimerScheduler::new().schedule(
            "failing",
            |_| async { Err(anyhow::anyhow!("tick failed")) },
            Duration::ZERO,
            Duration::from_secs(1),
            move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            },
        );

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(errors.load(Ordering::SeqCst), 3);
        assert!(!job.is_finished());
        job.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn do_not_continue_ends_the_job() {
        let job = TimerScheduler::new().schedule(
            "once",
            |_| async { Ok(TimerJobExecutionResult::DoNotContinueExecuting) },
            Duration::ZERO,
            Duration::from_secs(1),
            ignore,
        );

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(job.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_lets_the_in_flight_tick_finish() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();

        let job = TimerScheduler::new().schedule(
            "slow",
            move |signal: CancellationSignal| {
                let flag = flag.clone();
                async move {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    assert!(signal.is_cancelled());
                    flag.store(true, Ordering::SeqCst);
                    Ok(TimerJobExecutionResult::ScheduleNextExecution)
                }
            },
            Duration::ZERO,
            Duration::from_secs(60),
            ignore,
        );

        tokio::time::sleep(Duration::from_secs(1)).await;
        job.stop().await;

        assert!(finished.load(Ordering::SeqCst));
    }
}
