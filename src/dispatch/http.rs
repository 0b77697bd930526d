use std::time::Duration;

use eventsource_stream::{EventStreamError, Eventsource};
use futures_util::StreamExt;
use reqwest::Client;
use serde::Deserialize;

use crate::config::Config;
use crate::dispatch::{CompletionChannel, CompletionRequest, FragmentStream, StreamEvent};
use crate::error::TrickleError;

/// Cap on how much of a non-success response body is kept in the error.
pub const MAX_ERROR_BODY_BYTES: usize = 4 * 1024;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const DONE_MARKER: &str = "[DONE]";

/// OpenAI-compatible chat-completions channel over SSE.
pub struct HttpChannel {
    client: Client,
    provider: String,
    base_url: String,
    api_key: String,
}

#[derive(Deserialize)]
struct ChunkPayload {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Deserialize, Default)]
struct Delta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    message: String,
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

/// `error.type` OpenAI uses for transient failures on its side.
const SERVER_ERROR_TYPE: &str = "server_error";

impl HttpChannel {
    pub fn new(
        provider: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self, TrickleError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(4)
            .build()?;

        Ok(Self {
            client,
            provider: provider.into(),
            base_url: base_url.into(),
            api_key: api_key.into(),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, TrickleError> {
        let api_key = config.require_api_key()?;
        Self::new(provider_for_url(&config.base_url), &config.base_url, api_key)
    }

    fn request_body(req: &CompletionRequest) -> serde_json::Value {
        serde_json::json!({
            "model": req.model(),
            "messages": [{"role": "user", "content": req.prompt()}],
            "temperature": req.temperature(),
            "stream": req.stream(),
        })
    }
}

impl CompletionChannel for HttpChannel {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn open(&self, req: &CompletionRequest) -> Result<FragmentStream, TrickleError> {
        let response = self
            .client
            .post(&self.base_url)
            .bearer_auth(&self.api_key)
            .header("Accept", "text/event-stream")
            .json(&Self::request_body(req))
            .send()
            .await?;

        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(TrickleError::RateLimited {
                provider: self.provider.clone(),
            });
        }

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(TrickleError::AuthFailed {
                provider: self.provider.clone(),
                message: format!("{status}"),
            });
        }

        if !status.is_success() {
            let error_bytes = response.bytes().await.unwrap_or_default();
            let truncated = &error_bytes[..error_bytes.len().min(MAX_ERROR_BODY_BYTES)];
            let text = String::from_utf8_lossy(truncated);
            return Err(TrickleError::Upstream {
                provider: self.provider.clone(),
                message: format!("{status}: {text}"),
                status: Some(status.as_u16()),
            });
        }

        tracing::debug!(provider = %self.provider, model = req.model(), "stream opened");

        let provider = self.provider.clone();
        let events = response
            .bytes_stream()
            .eventsource()
            .filter_map(move |item| {
                let mapped = match item {
                    Ok(event) => parse_sse_data(&event.data, &provider),
                    Err(EventStreamError::Transport(e)) => Some(Err(TrickleError::Request(e))),
                    Err(e) => Some(Err(TrickleError::Fragment(e.to_string()))),
                };
                futures_util::future::ready(mapped)
            });

        Ok(Box::pin(events))
    }
}

/// Map one SSE `data:` payload to a stream item. Keepalives and chunks
/// without content (role headers, finish markers) yield `None`.
pub fn parse_sse_data(
    data: &str,
    provider: &str,
) -> Option<Result<StreamEvent, TrickleError>> {
    let data = data.trim();
    if data.is_empty() {
        return None;
    }
    if data == DONE_MARKER {
        return Some(Ok(StreamEvent::Done));
    }

    let payload: ChunkPayload = match serde_json::from_str(data) {
        Ok(p) => p,
        Err(e) => return Some(Err(TrickleError::Fragment(format!("invalid chunk JSON: {e}")))),
    };

    if let Some(err) = payload.error {
        let error = if err.kind.as_deref() == Some(SERVER_ERROR_TYPE) {
            TrickleError::ServerError {
                provider: provider.to_string(),
                message: err.message,
            }
        } else {
            TrickleError::Upstream {
                provider: provider.to_string(),
                message: err.message,
                status: None,
            }
        };
        return Some(Err(error));
    }

    payload
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|s| !s.is_empty())
        .map(|s| Ok(StreamEvent::Text(s)))
}

/// Derive a provider label from the endpoint host ("api.openai.com" -> "openai").
pub fn provider_for_url(base_url: &str) -> String {
    let host = reqwest::Url::parse(base_url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_default();
    if host.parse::<std::net::IpAddr>().is_ok() {
        return host;
    }
    let parts: Vec<&str> = host.split('.').collect();
    match parts.as_slice() {
        [] | [""] => "unknown".to_string(),
        [single] => (*single).to_string(),
        [.., name, _tld] => (*name).to_string(),
    }
}
