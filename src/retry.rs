//! Retry with capped exponential backoff.
//!
//! `RetryPolicy` re-invokes a fallible async operation while its error is
//! [`Retryable`]. Attempt 1 runs immediately; attempt `n >= 2` is preceded by
//! `min(base_delay * 2^(n-2), max_delay)`. Non-retryable errors end the
//! invocation after the attempt that produced them.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::RetrySettings;
use crate::error::TrickleError;

/// Marks which failures are eligible for another attempt.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Non-retryable failure, returned after the attempt that produced it.
    #[error("{0}")]
    Permanent(E),

    #[error("failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    /// The backoff sleep was interrupted by the policy's cancellation token.
    #[error("retry cancelled after {attempts} attempts: {last}")]
    Cancelled { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    /// The underlying error of the final attempt.
    pub fn into_inner(self) -> E {
        match self {
            Self::Permanent(e) => e,
            Self::Exhausted { last, .. } | Self::Cancelled { last, .. } => last,
        }
    }

    pub fn last(&self) -> &E {
        match self {
            Self::Permanent(e) => e,
            Self::Exhausted { last, .. } | Self::Cancelled { last, .. } => last,
        }
    }
}

/// What a single attempt ended with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Succeeded,
    RetryableFailure(String),
    PermanentFailure(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryAttempt {
    /// 1-based.
    pub attempt: u32,
    /// Backoff slept before this attempt (zero for the first).
    pub delay: Duration,
    pub outcome: AttemptOutcome,
}

/// Attempt history of one policy invocation.
#[derive(Debug, Clone, Default)]
pub struct RetryReport {
    pub attempts: Vec<RetryAttempt>,
}

impl RetryReport {
    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }

    /// Delays slept between attempts, in order (excludes the first attempt).
    pub fn delays(&self) -> Vec<Duration> {
        self.attempts.iter().skip(1).map(|a| a.delay).collect()
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    cancellation_token: Option<CancellationToken>,
}

impl RetryPolicy {
    pub fn new(
        max_retries: u32,
        base_delay: Duration,
        max_delay: Duration,
    ) -> Result<Self, TrickleError> {
        if max_retries == 0 {
            return Err(TrickleError::InvalidRequest(
                "max_retries must be at least 1".to_string(),
            ));
        }
        if base_delay.is_zero() {
            return Err(TrickleError::InvalidRequest(
                "base_delay must be positive".to_string(),
            ));
        }
        if max_delay < base_delay {
            return Err(TrickleError::InvalidRequest(format!(
                "max_delay ({max_delay:?}) must be >= base_delay ({base_delay:?})"
            )));
        }
        Ok(Self {
            max_retries,
            base_delay,
            max_delay,
            cancellation_token: None,
        })
    }

    pub fn from_settings(settings: &RetrySettings) -> Result<Self, TrickleError> {
        Self::new(
            settings.max_retries,
            Duration::from_millis(settings.base_delay_ms),
            Duration::from_millis(settings.max_delay_ms),
        )
    }

    /// Make the inter-attempt sleep cancellable.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = Some(token);
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Backoff slept before `attempt` (1-based). Saturates at `max_delay`.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        1u32.checked_shl(attempt - 2)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    /// `op` receives the 1-based attempt number.
    pub async fn execute<T, E, F, Fut>(&self, op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + fmt::Display,
    {
        self.execute_with_report(op).await.0
    }

    /// Like [`execute`](Self::execute), also returning the attempt history.
    pub async fn execute_with_report<T, E, F, Fut>(
        &self,
        mut op: F,
    ) -> (Result<T, RetryError<E>>, RetryReport)
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + fmt::Display,
    {
        let mut report = RetryReport::default();
        let mut attempt: u32 = 1;
        let mut delay = Duration::ZERO;

        loop {
            let err = match op(attempt).await {
                Ok(value) => {
                    report.attempts.push(RetryAttempt {
                        attempt,
                        delay,
                        outcome: AttemptOutcome::Succeeded,
                    });
                    return (Ok(value), report);
                }
                Err(e) => e,
            };

            if !err.is_retryable() {
                tracing::debug!(attempt, "permanent failure, not retrying: {err}");
                report.attempts.push(RetryAttempt {
                    attempt,
                    delay,
                    outcome: AttemptOutcome::PermanentFailure(err.to_string()),
                });
                return (Err(RetryError::Permanent(err)), report);
            }

            report.attempts.push(RetryAttempt {
                attempt,
                delay,
                outcome: AttemptOutcome::RetryableFailure(err.to_string()),
            });

            if attempt >= self.max_retries {
                tracing::error!(
                    attempts = attempt,
                    "giving up after {attempt} attempts: {err}"
                );
                return (
                    Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: err,
                    }),
                    report,
                );
            }

            delay = self.delay_before(attempt + 1);
            tracing::warn!(
                attempt,
                max_retries = self.max_retries,
                delay_ms = delay.as_millis() as u64,
                "attempt {attempt} failed: {err}"
            );

            if let Some(ref token) = self.cancellation_token {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::info!(attempts = attempt, "retry backoff cancelled");
                        return (
                            Err(RetryError::Cancelled {
                                attempts: attempt,
                                last: err,
                            }),
                            report,
                        );
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            } else {
                tokio::time::sleep(delay).await;
            }

            attempt += 1;
        }
    }
}
