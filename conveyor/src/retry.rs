//! Bounded retry with exponential backoff and jitter.
//!
//! [`RetryExecutor`] wraps any fallible async operation. Transient failures
//! are retried under a [`RetryPolicy`]; validation, conflict and fatal
//! failures return after a single attempt. Backoff waits are interruptible
//! through the shared [`RunToken`].

use crate::cancellation::RunToken;
use crate::errors::StepError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for retry behavior. Never mutated at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first.
    pub max_attempts: usize,
    /// Base delay before the first retry.
    pub base_delay: Duration,
    /// Cap applied to every computed delay.
    pub max_delay: Duration,
    /// Jitter applied to each delay, uniform in `[-ratio, +ratio] * delay`.
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_ratio: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with the default bounds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy tuned for remote transfers: fewer, longer waits.
    #[must_use]
    pub fn network() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            jitter_ratio: 0.25,
        }
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Sets the delay cap.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the jitter ratio.
    #[must_use]
    pub fn with_jitter_ratio(mut self, ratio: f64) -> Self {
        self.jitter_ratio = ratio;
        self
    }

    /// Computes the backoff delay after the given failed attempt (1-based):
    /// `min(max_delay, base_delay * 2^(attempt-1))`, before jitter.
    #[must_use]
    pub fn backoff_delay(&self, attempt: usize) -> Duration {
        let exponent = u32::try_from(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        let factor = 2u64.saturating_pow(exponent);
        let base_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let delay_ms = base_ms.saturating_mul(factor);
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(delay_ms.min(max_ms))
    }

    /// Applies uniform jitter in `[-jitter_ratio, +jitter_ratio]` to a delay,
    /// clamped to `[0, max_delay]`.
    #[must_use]
    pub fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter_ratio <= f64::EPSILON {
            return delay;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter_ratio..=self.jitter_ratio);
        let adjusted = delay.as_secs_f64() * (1.0 + spread);
        let capped = adjusted.clamp(0.0, self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }
}

/// One attempt of a retried operation, reported to the attempt hook.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    /// The operation key the executor was invoked with.
    pub key: String,
    /// 1-based attempt number.
    pub attempt: usize,
    /// The failure, if the attempt failed.
    pub error: Option<StepError>,
    /// The jittered delay scheduled before the next attempt, if any.
    pub retry_in: Option<Duration>,
}

/// Why a retried operation gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveUpReason {
    /// All attempts under the policy failed transiently.
    Exhausted,
    /// The error class forbids retrying.
    NonRetriable,
    /// The run token was cancelled mid-operation or mid-wait.
    Cancelled,
}

/// Terminal failure of a retried operation.
#[derive(Debug, Clone)]
pub struct RetryFailure {
    /// The last error observed.
    pub error: StepError,
    /// How many attempts were started.
    pub attempts: usize,
    /// Why no further attempts were made.
    pub reason: GiveUpReason,
}

impl RetryFailure {
    /// Collapses the failure into a single classified step error.
    #[must_use]
    pub fn into_step_error(self) -> StepError {
        match self.reason {
            GiveUpReason::Exhausted => StepError::new(
                self.error.kind,
                format!(
                    "retries exhausted after {} attempts: {}",
                    self.attempts, self.error.message
                ),
            ),
            GiveUpReason::NonRetriable => self.error,
            GiveUpReason::Cancelled => StepError::cancelled(self.error.message),
        }
    }
}

/// Successful result of a retried operation, with the attempt count.
#[derive(Debug)]
pub struct Retried<T> {
    /// The operation's value.
    pub value: T,
    /// How many attempts were needed.
    pub attempts: usize,
}

/// Hook invoked with every attempt outcome.
pub type AttemptHook = Arc<dyn Fn(&AttemptRecord) + Send + Sync>;

/// Drives fallible operations through bounded, jittered retries.
///
/// Holds no state between [`execute`](Self::execute) calls.
#[derive(Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    hook: Option<AttemptHook>,
}

impl std::fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("policy", &self.policy)
            .field("hook", &self.hook.is_some())
            .finish()
    }
}

impl RetryExecutor {
    /// Creates an executor with the given policy.
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, hook: None }
    }

    /// Attaches a hook receiving every attempt outcome.
    #[must_use]
    pub fn with_attempt_hook(mut self, hook: AttemptHook) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Returns the configured policy.
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn report(&self, record: &AttemptRecord) {
        if let Some(hook) = &self.hook {
            hook(record);
        }
    }

    /// Executes an operation under the policy.
    ///
    /// The attempt itself and every backoff wait race against cancellation of
    /// `token`; a cancelled token yields a [`GiveUpReason::Cancelled`] failure.
    ///
    /// # Errors
    ///
    /// Returns a [`RetryFailure`] when attempts are exhausted, the error is
    /// not retriable, or the run is cancelled.
    pub async fn execute<T, F, Fut>(
        &self,
        key: &str,
        token: &RunToken,
        mut operation: F,
    ) -> Result<Retried<T>, RetryFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StepError>>,
    {
        let mut attempt = 0usize;

        loop {
            if token.is_cancelled() {
                return Err(cancelled_failure(token, attempt));
            }
            attempt += 1;

            let outcome = tokio::select! {
                outcome = operation() => outcome,
                () = token.cancelled() => {
                    tracing::warn!(key, attempt, "attempt cancelled mid-flight");
                    return Err(cancelled_failure(token, attempt));
                }
            };

            match outcome {
                Ok(value) => {
                    self.report(&AttemptRecord {
                        key: key.to_string(),
                        attempt,
                        error: None,
                        retry_in: None,
                    });
                    tracing::debug!(key, attempt, "operation succeeded");
                    return Ok(Retried { value, attempts: attempt });
                }
                Err(err) if !err.is_retriable() => {
                    self.report(&AttemptRecord {
                        key: key.to_string(),
                        attempt,
                        error: Some(err.clone()),
                        retry_in: None,
                    });
                    tracing::warn!(key, attempt, error = %err, "non-retriable failure");
                    return Err(RetryFailure {
                        error: err,
                        attempts: attempt,
                        reason: GiveUpReason::NonRetriable,
                    });
                }
                Err(err) => {
                    if attempt >= self.policy.max_attempts {
                        self.report(&AttemptRecord {
                            key: key.to_string(),
                            attempt,
                            error: Some(err.clone()),
                            retry_in: None,
                        });
                        tracing::warn!(key, attempt, error = %err, "retries exhausted");
                        return Err(RetryFailure {
                            error: err,
                            attempts: attempt,
                            reason: GiveUpReason::Exhausted,
                        });
                    }

                    let delay = self.policy.jittered(self.policy.backoff_delay(attempt));
                    self.report(&AttemptRecord {
                        key: key.to_string(),
                        attempt,
                        error: Some(err.clone()),
                        retry_in: Some(delay),
                    });
                    tracing::warn!(
                        key,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "retrying after transient failure"
                    );

                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = token.cancelled() => {
                            tracing::warn!(key, attempt, "backoff wait interrupted by cancellation");
                            return Err(cancelled_failure(token, attempt));
                        }
                    }
                }
            }
        }
    }
}

fn cancelled_failure(token: &RunToken, attempts: usize) -> RetryFailure {
    let reason = token
        .reason()
        .unwrap_or_else(|| "run cancelled".to_string());
    RetryFailure {
        error: StepError::cancelled(reason),
        attempts,
        reason: GiveUpReason::Cancelled,
    }
}
