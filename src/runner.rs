//! Time-bounded consumption of one completion stream.
//!
//! The whole call (opening the channel plus reading every fragment) shares a
//! single absolute deadline computed when `run` starts. Each wait is a
//! `timeout_at(deadline, ..)`, so a peer that stops sending without closing
//! the connection is cut off at the deadline like any other slow stream.

use std::future::Future;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::dispatch::{CompletionChannel, CompletionRequest, StreamEvent};
use crate::error::TrickleError;

/// Result of one runner invocation. Partial text is always kept.
#[derive(Debug)]
pub enum CompletionOutcome {
    /// The channel signalled end-of-stream before the deadline.
    Complete { text: String },
    /// The deadline expired first. Not an error: `partial` is what arrived.
    TimedOut { partial: String, elapsed: Duration },
    Failed {
        error: TrickleError,
        partial: String,
    },
}

impl CompletionOutcome {
    /// Full or partial text accumulated by the invocation.
    pub fn text(&self) -> &str {
        match self {
            Self::Complete { text } => text,
            Self::TimedOut { partial, .. } | Self::Failed { partial, .. } => partial,
        }
    }

    pub fn into_text(self) -> String {
        match self {
            Self::Complete { text } => text,
            Self::TimedOut { partial, .. } | Self::Failed { partial, .. } => partial,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete { .. })
    }

    pub fn error(&self) -> Option<&TrickleError> {
        match self {
            Self::Failed { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Complete { .. } => "complete",
            Self::TimedOut { .. } => "timed_out",
            Self::Failed { .. } => "failed",
        }
    }
}

/// What a live observer receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObserverEvent {
    /// A new attempt (1-based) is starting. Text from earlier attempts is
    /// superseded by whatever follows.
    AttemptStarted(u32),
    Fragment(String),
}

enum Wait<T> {
    Ready(T),
    Expired,
    Cancelled,
}

/// Issues one streaming completion and drives it to an outcome.
///
/// Each fragment is, in order: written and flushed to the sink, appended to
/// the in-memory text, and sent to the observer (if any). The sink therefore
/// always holds exactly the accumulated text.
#[derive(Debug, Clone, Default)]
pub struct StreamingCompletionRunner {
    observer: Option<mpsc::UnboundedSender<ObserverEvent>>,
    cancellation_token: Option<CancellationToken>,
}

impl StreamingCompletionRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live echo of fragments. Unbounded, so a slow consumer never stalls the stream.
    pub fn with_observer(mut self, observer: mpsc::UnboundedSender<ObserverEvent>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Tell the observer that a fresh attempt begins.
    pub fn announce_attempt(&self, attempt: u32) {
        self.notify(ObserverEvent::AttemptStarted(attempt));
    }

    fn notify(&self, event: ObserverEvent) {
        if let Some(ref observer) = self.observer {
            // A closed observer only means nobody is watching.
            let _ = observer.send(event);
        }
    }

    /// Cooperative early stop. A cancelled run returns `Failed(Cancelled)`
    /// carrying the text received so far.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = Some(token);
        self
    }

    pub async fn run<C, W>(
        &self,
        channel: &C,
        req: &CompletionRequest,
        sink: &mut W,
    ) -> CompletionOutcome
    where
        C: CompletionChannel,
        W: AsyncWrite + Unpin + Send,
    {
        let start = Instant::now();
        let deadline = start + req.timeout();
        let provider = channel.provider();

        tracing::info!(
            provider,
            model = req.model(),
            timeout_ms = req.timeout().as_millis() as u64,
            "starting completion stream"
        );

        let mut stream = match self.wait(deadline, channel.open(req)).await {
            Wait::Ready(Ok(stream)) => stream,
            Wait::Ready(Err(error)) => {
                tracing::warn!(
                    provider,
                    retryable = error.is_retryable(),
                    "failed to open stream: {error}"
                );
                return CompletionOutcome::Failed {
                    error,
                    partial: String::new(),
                };
            }
            Wait::Expired => {
                let elapsed = start.elapsed();
                tracing::warn!(
                    provider,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "deadline expired before the stream opened"
                );
                return CompletionOutcome::TimedOut {
                    partial: String::new(),
                    elapsed,
                };
            }
            Wait::Cancelled => {
                return CompletionOutcome::Failed {
                    error: TrickleError::Cancelled(start.elapsed().as_millis() as u64),
                    partial: String::new(),
                };
            }
        };

        let mut text = String::new();
        let mut fragments: usize = 0;
        let mut skipped: usize = 0;

        loop {
            let next = match self.wait(deadline, stream.next()).await {
                Wait::Ready(item) => item,
                Wait::Expired => {
                    let elapsed = start.elapsed();
                    tracing::warn!(
                        provider,
                        fragments,
                        chars = text.len(),
                        elapsed_ms = elapsed.as_millis() as u64,
                        "deadline expired mid-stream, returning partial text"
                    );
                    return CompletionOutcome::TimedOut {
                        partial: text,
                        elapsed,
                    };
                }
                Wait::Cancelled => {
                    let elapsed_ms = start.elapsed().as_millis() as u64;
                    tracing::info!(provider, fragments, elapsed_ms, "stream cancelled");
                    return CompletionOutcome::Failed {
                        error: TrickleError::Cancelled(elapsed_ms),
                        partial: text,
                    };
                }
            };

            match next {
                Some(Ok(StreamEvent::Text(fragment))) => {
                    if fragment.is_empty() {
                        continue;
                    }
                    if let Err(e) = write_fragment(sink, &fragment).await {
                        tracing::error!(provider, fragments, "sink write failed: {e}");
                        return CompletionOutcome::Failed {
                            error: TrickleError::Sink(e),
                            partial: text,
                        };
                    }
                    text.push_str(&fragment);
                    fragments += 1;
                    tracing::trace!(fragment = fragments, len = fragment.len(), "fragment");
                    self.notify(ObserverEvent::Fragment(fragment));
                }
                Some(Ok(StreamEvent::Done)) => {
                    tracing::info!(
                        provider,
                        fragments,
                        skipped,
                        chars = text.len(),
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "completion stream finished"
                    );
                    if text.is_empty() {
                        tracing::warn!(provider, "stream finished without any text");
                    }
                    return CompletionOutcome::Complete { text };
                }
                Some(Err(TrickleError::Fragment(msg))) => {
                    skipped += 1;
                    tracing::warn!(provider, skipped, "skipping malformed fragment: {msg}");
                }
                Some(Err(error)) => {
                    return Self::channel_failure(provider, error, text);
                }
                None => {
                    let error = if text.is_empty() {
                        TrickleError::Disconnected {
                            provider: provider.to_string(),
                        }
                    } else {
                        TrickleError::Interrupted {
                            received: text.len(),
                            message: "stream ended without end-of-stream signal".to_string(),
                        }
                    };
                    return Self::channel_failure(provider, error, text);
                }
            }
        }
    }

    /// Before any text the error is passed through unchanged (and may be
    /// retryable). After text was persisted it becomes a non-retryable
    /// `Interrupted`, keeping the partial text.
    fn channel_failure(provider: &str, error: TrickleError, text: String) -> CompletionOutcome {
        let error = match error {
            e @ TrickleError::Interrupted { .. } => e,
            e if !text.is_empty() => TrickleError::Interrupted {
                received: text.len(),
                message: e.to_string(),
            },
            e => e,
        };
        tracing::warn!(
            provider,
            chars = text.len(),
            retryable = error.is_retryable(),
            "stream failed: {error}"
        );
        CompletionOutcome::Failed {
            error,
            partial: text,
        }
    }

    async fn wait<F: Future>(&self, deadline: Instant, fut: F) -> Wait<F::Output> {
        tokio::select! {
            biased;
            _ = cancelled(self.cancellation_token.as_ref()) => Wait::Cancelled,
            result = tokio::time::timeout_at(deadline, fut) => match result {
                Ok(value) => Wait::Ready(value),
                Err(_) => Wait::Expired,
            },
        }
    }
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

async fn write_fragment<W>(sink: &mut W, fragment: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    sink.write_all(fragment.as_bytes()).await?;
    sink.flush().await
}
