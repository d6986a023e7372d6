//! RetryExecutor - exponential backoff around a single delivery.
//!
//! Transient failures (rate limiting, unavailable upstream, timeouts,
//! dropped connections) are retried with `base_delay * 2^attempt`, capped
//! at `max_delay`, up to the mode's `max_retries`. Anything else returns at
//! once, tagged so the caller records it as a terminal per-prompt result
//! rather than aborting the run.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::config::{RetryConfig, RetryPolicy};
use crate::target::{ErrorClass, TargetError};
use crate::types::ExecutionMode;

/// Successful delivery plus what it cost
#[derive(Debug, Clone)]
pub struct RetryOutcome<T> {
    pub value: T,
    pub attempts: u32,
    pub delays: Vec<Duration>,
}

impl<T> RetryOutcome<T> {
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Why a delivery ended without success
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Not worth retrying (auth, validation, programmer error)
    Fatal,
    /// Retryable, but the mode's retry budget ran out
    Exhausted,
    /// The run was cancelled during a backoff wait
    Cancelled,
}

/// Terminal failure of a delivery; never recoverable by the caller
#[derive(Debug, Clone)]
pub struct RetryFailure {
    pub error: TargetError,
    pub kind: FailureKind,
    pub attempts: u32,
    pub delays: Vec<Duration>,
}

impl RetryFailure {
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

impl std::fmt::Display for RetryFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            FailureKind::Fatal => "fatal",
            FailureKind::Exhausted => "retries exhausted",
            FailureKind::Cancelled => "cancelled",
        };
        write!(f, "{} after {} attempt(s): {}", kind, self.attempts, self.error)
    }
}

/// Backoff delay before retry number `attempt` (0-based)
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32, max_delay: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempt);
    policy.base_delay().saturating_mul(factor).min(max_delay)
}

/// Wraps deliveries with mode-specific retry policies
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn policy(&self, mode: ExecutionMode) -> RetryPolicy {
        self.config.policy(mode)
    }

    /// Run `operation` until it succeeds, fails fatally, or the retry budget
    /// for `mode` is spent.
    pub async fn send<T, F, Fut>(
        &self,
        mode: ExecutionMode,
        operation: F,
    ) -> Result<RetryOutcome<T>, RetryFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TargetError>>,
    {
        self.send_cancellable(mode, CancelToken::never(), operation).await
    }

    /// Like [`send`](Self::send), but backoff waits end early when `cancel`
    /// fires. An attempt already in flight is never interrupted.
    pub async fn send_cancellable<T, F, Fut>(
        &self,
        mode: ExecutionMode,
        mut cancel: CancelToken,
        mut operation: F,
    ) -> Result<RetryOutcome<T>, RetryFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TargetError>>,
    {
        let policy = self.config.policy(mode);
        let max_delay = self.config.max_delay();
        let mut delays = Vec::new();
        let mut attempt: u32 = 0;

        loop {
            let error = match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(
                            mode = %mode,
                            attempts = attempt + 1,
                            "Delivery succeeded after retries"
                        );
                    }
                    return Ok(RetryOutcome {
                        value,
                        attempts: attempt + 1,
                        delays,
                    });
                }
                Err(error) => error,
            };

            if error.classify() == ErrorClass::Fatal {
                debug!(mode = %mode, error = %error, "Fatal delivery error, not retrying");
                return Err(RetryFailure {
                    error,
                    kind: FailureKind::Fatal,
                    attempts: attempt + 1,
                    delays,
                });
            }

            if attempt >= policy.max_retries {
                warn!(
                    mode = %mode,
                    attempts = attempt + 1,
                    error = %error,
                    "Retry budget exhausted"
                );
                return Err(RetryFailure {
                    error,
                    kind: FailureKind::Exhausted,
                    attempts: attempt + 1,
                    delays,
                });
            }

            let delay = backoff_delay(&policy, attempt, max_delay);
            warn!(
                mode = %mode,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retryable delivery error, backing off"
            );
            delays.push(delay);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    return Err(RetryFailure {
                        error,
                        kind: FailureKind::Cancelled,
                        attempts: attempt + 1,
                        delays,
                    });
                }
            }

            attempt += 1;
        }
    }
}
