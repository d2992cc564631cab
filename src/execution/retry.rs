//! Bounded retry with constant or exponential backoff

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{FinalFailure, TaskFailure};

const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayStrategy {
    #[default]
    Constant,
    /// `delay * 2^(retry - 1)`, capped at the policy's `max_delay`
    Exponential,
}

/// How many times to attempt a unit of work and how long to wait in between
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    pub strategy: DelayStrategy,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl RetryPolicy {
    /// A single attempt
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            delay: Duration::ZERO,
            strategy: DelayStrategy::Constant,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }

    pub fn constant(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            strategy: DelayStrategy::Constant,
            max_delay: DEFAULT_MAX_DELAY.max(delay),
        }
    }

    pub fn exponential(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay: initial_delay,
            strategy: DelayStrategy::Exponential,
            max_delay: DEFAULT_MAX_DELAY.max(initial_delay),
        }
    }

    /// `retries` retries after the first attempt, i.e. `retries + 1` attempts
    pub fn retries(retries: u32, delay: Duration) -> Self {
        Self::constant(retries.saturating_add(1), delay)
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Wait before retry number `retry` (1 = the wait after the first failure)
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        match self.strategy {
            DelayStrategy::Constant => self.delay,
            DelayStrategy::Exponential => {
                let exponent = retry.saturating_sub(1).min(31);
                self.delay
                    .checked_mul(1u32 << exponent)
                    .unwrap_or(self.max_delay)
                    .min(self.max_delay)
            }
        }
    }
}

/// What happened on one attempt
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Succeeded,
    Failed {
        failure: TaskFailure,
        /// Wait before the next attempt, `None` when this was the last one
        retry_in: Option<Duration>,
    },
}

/// Receives an event for every attempt the executor makes
pub trait AttemptObserver: Send + Sync {
    fn on_attempt(&self, task: &str, attempt: u32, outcome: &AttemptOutcome);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl AttemptObserver for NoopObserver {
    fn on_attempt(&self, _task: &str, _attempt: u32, _outcome: &AttemptOutcome) {}
}

/// Logs attempts through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl AttemptObserver for TracingObserver {
    fn on_attempt(&self, task: &str, attempt: u32, outcome: &AttemptOutcome) {
        match outcome {
            AttemptOutcome::Succeeded if attempt > 1 => {
                tracing::info!(task, attempt, "task passed on retry");
            }
            AttemptOutcome::Succeeded => {}
            AttemptOutcome::Failed {
                failure,
                retry_in: Some(delay),
            } => {
                tracing::warn!(
                    task,
                    attempt,
                    error = %failure,
                    "attempt failed, retrying in {}ms",
                    delay.as_millis()
                );
            }
            AttemptOutcome::Failed {
                failure,
                retry_in: None,
            } => {
                tracing::warn!(task, attempt, error = %failure, "attempt failed, giving up");
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttemptRecord {
    pub task: String,
    pub attempt: u32,
    pub outcome: AttemptOutcome,
}

/// Keeps every attempt event in memory
#[derive(Debug, Default)]
pub struct RecordingObserver {
    records: Mutex<Vec<AttemptRecord>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AttemptRecord> {
        self.records.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn attempts_for(&self, task: &str) -> usize {
        self.records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|r| r.task == task)
            .count()
    }
}

impl AttemptObserver for RecordingObserver {
    fn on_attempt(&self, task: &str, attempt: u32, outcome: &AttemptOutcome) {
        self.records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(AttemptRecord {
                task: task.to_string(),
                attempt,
                outcome: outcome.clone(),
            });
    }
}

/// Execute `work` under `policy`.
///
/// `work` receives the 1-based attempt number. An attempt that exceeds
/// `timeout` counts as a failed attempt. Permanent failures end the loop
/// immediately. On success returns the value and the attempts it took.
pub async fn execute_with_retry<F, Fut, T>(
    task_name: &str,
    policy: &RetryPolicy,
    timeout: Option<Duration>,
    observer: &dyn AttemptObserver,
    mut work: F,
) -> Result<(T, u32), FinalFailure>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, TaskFailure>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        let result = match timeout {
            Some(limit) => match tokio::time::timeout(limit, work(attempt)).await {
                Ok(result) => result,
                Err(_) => Err(TaskFailure::TimedOut(limit)),
            },
            None => work(attempt).await,
        };

        match result {
            Ok(value) => {
                observer.on_attempt(task_name, attempt, &AttemptOutcome::Succeeded);
                return Ok((value, attempt));
            }
            Err(failure) => {
                let retry_in = (failure.is_retryable() && attempt < max_attempts)
                    .then(|| policy.delay_for_retry(attempt));

                observer.on_attempt(
                    task_name,
                    attempt,
                    &AttemptOutcome::Failed {
                        failure: failure.clone(),
                        retry_in,
                    },
                );

                match retry_in {
                    Some(delay) => {
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                    }
                    None => {
                        return Err(FinalFailure {
                            cause: failure,
                            attempts: attempt,
                        })
                    }
                }
            }
        }
    }
}
