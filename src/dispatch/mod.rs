pub mod http;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures_util::Stream;

use crate::config::MAX_TIMEOUT_SECS;
use crate::error::TrickleError;

/// One completion call: what to ask, and how long the whole call may take.
/// Validated on construction and immutable afterwards.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    model: String,
    prompt: String,
    temperature: f64,
    stream: bool,
    timeout: Duration,
}

impl CompletionRequest {
    /// Streaming request. Fails with `InvalidRequest` on an empty prompt or
    /// model, a temperature outside 0.0..=2.0, or a zero timeout.
    pub fn new(
        model: impl Into<String>,
        prompt: impl Into<String>,
        temperature: f64,
        timeout: Duration,
    ) -> Result<Self, TrickleError> {
        let model = model.into();
        let prompt = prompt.into();

        if prompt.trim().is_empty() {
            return Err(TrickleError::InvalidRequest("prompt is empty".to_string()));
        }
        if model.trim().is_empty() {
            return Err(TrickleError::InvalidRequest("model is empty".to_string()));
        }
        if !temperature.is_finite() || !(0.0..=2.0).contains(&temperature) {
            return Err(TrickleError::InvalidRequest(format!(
                "temperature must be within 0.0..=2.0, got {temperature}"
            )));
        }
        if timeout.is_zero() {
            return Err(TrickleError::InvalidRequest(
                "timeout must be positive".to_string(),
            ));
        }
        if timeout > Duration::from_secs(MAX_TIMEOUT_SECS) {
            return Err(TrickleError::InvalidRequest(format!(
                "timeout must not exceed {MAX_TIMEOUT_SECS}s"
            )));
        }

        Ok(Self {
            model,
            prompt,
            temperature,
            stream: true,
            timeout,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    pub fn stream(&self) -> bool {
        self.stream
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Item yielded by a completion channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// One fragment of response text, in arrival order.
    Text(String),
    /// Explicit end-of-stream signal.
    Done,
}

/// Fragments as they arrive. `Err(TrickleError::Fragment)` items are
/// recoverable; any other error ends the stream.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, TrickleError>> + Send>>;

/// The remote completion capability: given a request, produce a stream of
/// text fragments terminated by [`StreamEvent::Done`].
pub trait CompletionChannel: Send + Sync {
    /// Provider label for logs and error messages.
    fn provider(&self) -> &str;

    /// Establish the stream. Errors here happen before any data arrives.
    fn open(
        &self,
        req: &CompletionRequest,
    ) -> impl Future<Output = Result<FragmentStream, TrickleError>> + Send;
}
