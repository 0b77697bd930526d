use thiserror::Error;

use crate::retry::{RetryError, Retryable};

#[derive(Debug, Error)]
pub enum TrickleError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("connection to {provider} closed before any data was received")]
    Disconnected { provider: String },

    #[error("rate limited by {provider}")]
    RateLimited { provider: String },

    #[error("auth failed for {provider}: {message}")]
    AuthFailed { provider: String, message: String },

    #[error("upstream error from {provider}: {message}")]
    Upstream {
        provider: String,
        message: String,
        status: Option<u16>,
    },

    /// Server-side failure reported inside the event stream.
    #[error("server error from {provider}: {message}")]
    ServerError { provider: String, message: String },

    #[error("malformed stream fragment: {0}")]
    Fragment(String),

    #[error("stream interrupted after {received} bytes: {message}")]
    Interrupted { received: usize, message: String },

    #[error("cancelled after {0}ms")]
    Cancelled(u64),

    #[error("sink write failed: {0}")]
    Sink(#[source] std::io::Error),

    #[error("failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<TrickleError>,
    },

    #[error("{0}")]
    Other(String),
}

impl TrickleError {
    /// Returns true for transient channel errors that may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::Disconnected { .. } => true,
            Self::Upstream { status, .. } => {
                // 5xx = server error (retryable), 4xx = client error (not retryable)
                // status: None = not from HTTP, treated as permanent
                status.is_some_and(|s| s >= 500)
            }
            // Builder, redirect and decode errors will fail the same way again.
            Self::Request(e) => e.is_connect() || e.is_timeout() || e.is_request() || e.is_body(),
            Self::ServerError { .. } => true,
            _ => false,
        }
    }

    /// Short machine-readable label, used in logs and the transcript summary.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::Config(_) => "config",
            Self::Request(_) => "request",
            Self::Disconnected { .. } => "disconnected",
            Self::RateLimited { .. } => "rate_limited",
            Self::AuthFailed { .. } => "auth_failed",
            Self::Upstream { .. } => "upstream",
            Self::ServerError { .. } => "server_error",
            Self::Fragment(_) => "fragment",
            Self::Interrupted { .. } => "interrupted",
            Self::Cancelled(_) => "cancelled",
            Self::Sink(_) => "sink",
            Self::RetriesExhausted { .. } => "retries_exhausted",
            Self::Other(_) => "other",
        }
    }

    /// Produce a sanitized one-line message for the terminal.
    /// Does not leak URLs, connection details, or upstream error bodies.
    pub fn user_message(&self) -> String {
        match self {
            Self::InvalidRequest(msg) => format!("invalid request: {msg}"),
            Self::Config(msg) => format!("configuration error: {msg}"),
            Self::Request(_) => "request to provider failed".to_string(),
            Self::Disconnected { provider } => {
                format!("{provider} closed the connection before responding")
            }
            Self::RateLimited { provider } => {
                format!("rate limited by {provider}, try again shortly")
            }
            Self::AuthFailed { provider, message } => {
                format!("authentication failed for {provider}: {message}")
            }
            Self::Upstream {
                provider, status, ..
            } => match status {
                Some(code) => format!("upstream error from {provider} (HTTP {code})"),
                None => format!("upstream error from {provider}"),
            },
            Self::ServerError { provider, .. } => format!("{provider} reported a server error"),
            Self::Fragment(_) => "failed to parse a response fragment".to_string(),
            Self::Interrupted { received, .. } => {
                format!("stream interrupted after {received} bytes")
            }
            Self::Cancelled(ms) => format!("cancelled after {ms}ms"),
            Self::Sink(e) => format!("could not write transcript: {e}"),
            Self::RetriesExhausted { attempts, last } => {
                format!("gave up after {attempts} attempts: {}", last.user_message())
            }
            Self::Other(msg) => msg.clone(),
        }
    }
}

impl Retryable for TrickleError {
    fn is_retryable(&self) -> bool {
        TrickleError::is_retryable(self)
    }
}

impl From<RetryError<TrickleError>> for TrickleError {
    fn from(err: RetryError<TrickleError>) -> Self {
        match err {
            RetryError::Permanent(e) => e,
            RetryError::Exhausted { attempts, last } => Self::RetriesExhausted {
                attempts,
                last: Box::new(last),
            },
            RetryError::Cancelled { attempts, last } => {
                Self::Other(format!("retry cancelled after {attempts} attempts: {last}"))
            }
        }
    }
}
