use std::fmt;
use std::time::{Duration, Instant};

use crate::dispatch::{CompletionChannel, CompletionRequest};
use crate::error::TrickleError;
use crate::retry::{RetryError, RetryPolicy, RetryReport, Retryable};
use crate::runner::{CompletionOutcome, StreamingCompletionRunner};
use crate::transcript::{Transcript, TranscriptSummary, now_ms};

/// Why an attempt is handed back to the retry policy.
#[derive(Debug)]
enum AttemptError {
    Channel(TrickleError),
    TimedOut { partial: String, elapsed: Duration },
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Channel(e) => write!(f, "{e}"),
            Self::TimedOut { elapsed, partial } => write!(
                f,
                "timed out after {}ms with {} chars",
                elapsed.as_millis(),
                partial.len()
            ),
        }
    }
}

impl Retryable for AttemptError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Channel(e) => e.is_retryable(),
            // Only constructed when the session opted into timeout retries.
            Self::TimedOut { .. } => true,
        }
    }
}

#[derive(Debug)]
pub struct SessionOutcome {
    pub outcome: CompletionOutcome,
    pub report: RetryReport,
    pub elapsed: Duration,
}

/// A retry-wrapped streaming completion with a persisted transcript.
///
/// Retryable `Failed` outcomes (connection refused, 5xx, rate limits)
/// trigger a fresh, fully timed attempt. `TimedOut` is returned as-is unless
/// `retry_on_timeout` is set.
pub struct CompletionSession<C> {
    channel: C,
    runner: StreamingCompletionRunner,
    policy: RetryPolicy,
    transcript: Transcript,
    retry_on_timeout: bool,
}

impl<C: CompletionChannel> CompletionSession<C> {
    pub fn new(
        channel: C,
        runner: StreamingCompletionRunner,
        policy: RetryPolicy,
        transcript: Transcript,
    ) -> Self {
        Self {
            channel,
            runner,
            policy,
            transcript,
            retry_on_timeout: false,
        }
    }

    pub fn retry_on_timeout(mut self, enabled: bool) -> Self {
        self.retry_on_timeout = enabled;
        self
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    /// Run the request under the retry policy. Returns `Err` for permanent
    /// setup failures (sink cannot be opened) and for `RetriesExhausted`;
    /// every other result is a `CompletionOutcome`.
    pub async fn complete(&self, req: &CompletionRequest) -> Result<SessionOutcome, TrickleError> {
        let start = Instant::now();
        let this = self;

        let (result, report) = self
            .policy
            .execute_with_report(move |attempt| async move {
                let mut sink = match this.transcript.open_attempt().await {
                    Ok(file) => file,
                    Err(e) => return Err(AttemptError::Channel(TrickleError::Sink(e))),
                };

                tracing::debug!(attempt, path = %this.transcript.path().display(), "attempt started");
                this.runner.announce_attempt(attempt);

                match this.runner.run(&this.channel, req, &mut sink).await {
                    // Retryable failures never carry partial text.
                    CompletionOutcome::Failed { error, .. } if error.is_retryable() => {
                        Err(AttemptError::Channel(error))
                    }
                    CompletionOutcome::TimedOut { partial, elapsed } if this.retry_on_timeout => {
                        Err(AttemptError::TimedOut { partial, elapsed })
                    }
                    outcome => Ok(outcome),
                }
            })
            .await;

        let result = match result {
            Ok(outcome) => Ok(outcome),
            Err(RetryError::Permanent(AttemptError::Channel(e))) => Err(e),
            Err(RetryError::Exhausted {
                attempts,
                last: AttemptError::Channel(e),
            }) => Err(TrickleError::RetriesExhausted {
                attempts,
                last: Box::new(e),
            }),
            Err(RetryError::Cancelled {
                attempts,
                last: AttemptError::Channel(e),
            }) => {
                tracing::info!(attempts, "retries cancelled, last error: {e}");
                Ok(CompletionOutcome::Failed {
                    error: TrickleError::Cancelled(start.elapsed().as_millis() as u64),
                    partial: String::new(),
                })
            }
            // Timeout retries ran out (or were cancelled): the last partial
            // result is still the best answer available.
            Err(
                RetryError::Exhausted {
                    last: AttemptError::TimedOut { partial, elapsed },
                    ..
                }
                | RetryError::Cancelled {
                    last: AttemptError::TimedOut { partial, elapsed },
                    ..
                }
                | RetryError::Permanent(AttemptError::TimedOut { partial, elapsed }),
            ) => Ok(CompletionOutcome::TimedOut { partial, elapsed }),
        };

        let elapsed = start.elapsed();
        self.persist_summary(req, &result, report.attempt_count(), elapsed)
            .await;

        result.map(|outcome| SessionOutcome {
            outcome,
            report,
            elapsed,
        })
    }

    async fn persist_summary(
        &self,
        req: &CompletionRequest,
        result: &Result<CompletionOutcome, TrickleError>,
        attempts: u32,
        elapsed: Duration,
    ) {
        let (outcome, error, chars) = match result {
            Ok(o) => (
                o.kind().to_string(),
                o.error().map(|e| e.to_string()),
                o.text().len(),
            ),
            Err(e) => ("error".to_string(), Some(e.to_string()), 0),
        };

        let summary = TranscriptSummary {
            model: req.model().to_string(),
            provider: self.channel.provider().to_string(),
            outcome,
            error,
            attempts,
            elapsed_ms: elapsed.as_millis() as u64,
            chars,
            finished_at_ms: now_ms(),
        };

        match self.transcript.write_summary(&summary).await {
            Ok(path) => tracing::debug!(path = %path.display(), "transcript summary written"),
            Err(e) => tracing::warn!("failed to write transcript summary: {e}"),
        }
    }
}
