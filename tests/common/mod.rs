//! Shared test helpers: a scripted in-memory completion channel and a
//! mock SSE server on localhost.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use futures_util::{StreamExt, stream};
use tokio::net::TcpListener;

use trickle::dispatch::{CompletionChannel, CompletionRequest, FragmentStream, StreamEvent};
use trickle::error::TrickleError;

/// What the channel does on a given open (1-based).
pub enum Script {
    /// `open` fails before any data.
    Refuse(TrickleError),
    /// `open` never resolves.
    Hang,
    /// Yield `items`, then either end the stream or stall forever.
    Stream {
        items: Vec<Result<StreamEvent, TrickleError>>,
        stall: bool,
    },
}

type ScriptFn = Box<dyn Fn(u32) -> Script + Send + Sync>;

pub struct ScriptedChannel {
    script: ScriptFn,
    opens: AtomicU32,
}

impl ScriptedChannel {
    pub fn new(script: impl Fn(u32) -> Script + Send + Sync + 'static) -> Self {
        Self {
            script: Box::new(script),
            opens: AtomicU32::new(0),
        }
    }

    /// Same script on every open.
    pub fn always(items: Vec<Result<StreamEvent, TrickleError>>, stall: bool) -> Self {
        Self::new(move |_| Script::Stream {
            items: items
                .iter()
                .map(|item| match item {
                    Ok(ev) => Ok(ev.clone()),
                    Err(e) => Err(TrickleError::Fragment(e.to_string())),
                })
                .collect(),
            stall,
        })
    }

    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }
}

impl CompletionChannel for ScriptedChannel {
    fn provider(&self) -> &str {
        "scripted"
    }

    async fn open(&self, _req: &CompletionRequest) -> Result<FragmentStream, TrickleError> {
        let n = self.opens.fetch_add(1, Ordering::SeqCst) + 1;
        match (self.script)(n) {
            Script::Refuse(e) => Err(e),
            Script::Hang => {
                std::future::pending::<()>().await;
                unreachable!("pending never resolves")
            }
            Script::Stream { items, stall: false } => Ok(Box::pin(stream::iter(items))),
            Script::Stream { items, stall: true } => {
                Ok(Box::pin(stream::iter(items).chain(stream::pending())))
            }
        }
    }
}

pub fn text(s: &str) -> Result<StreamEvent, TrickleError> {
    Ok(StreamEvent::Text(s.to_string()))
}

pub fn done() -> Result<StreamEvent, TrickleError> {
    Ok(StreamEvent::Done)
}

pub fn malformed() -> Result<StreamEvent, TrickleError> {
    Err(TrickleError::Fragment("invalid chunk JSON".to_string()))
}

pub fn unavailable() -> TrickleError {
    TrickleError::Upstream {
        provider: "scripted".to_string(),
        message: "503 Service Unavailable".to_string(),
        status: Some(503),
    }
}

pub fn request(timeout: Duration) -> CompletionRequest {
    CompletionRequest::new("test-model", "test prompt", 0.7, timeout).unwrap()
}

// ---------------------------------------------------------------------------
// Mock SSE server
// ---------------------------------------------------------------------------

pub const SSE_HEADERS: &[u8] = b"HTTP/1.1 200 OK\r\n\
    Content-Type: text/event-stream\r\n\
    Connection: close\r\n\r\n";

pub const SSE_DONE: &[u8] = b"data: [DONE]\n\n";

/// Bind a TCP listener on localhost and return (listener, port).
pub async fn mock_listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

/// Format an SSE data event carrying one content delta.
pub fn sse_chunk(content: &str) -> String {
    let payload = serde_json::json!({"choices": [{"delta": {"content": content}}]});
    format!("data: {payload}\n\n")
}

/// A complete HTTP response with a plain-text body.
pub fn http_response(status_line: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {status_line}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
}

pub fn endpoint(port: u16) -> String {
    format!("http://127.0.0.1:{port}/v1/chat/completions")
}

/// Read one full HTTP request (headers plus Content-Length body).
pub async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
    use tokio::io::AsyncReadExt;

    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = socket.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);

        let text = String::from_utf8_lossy(&data);
        if let Some(header_end) = text.find("\r\n\r\n") {
            let content_length = text[..header_end]
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())
                        .flatten()
                })
                .unwrap_or(0);
            if data.len() >= header_end + 4 + content_length {
                break;
            }
        }
    }
    String::from_utf8_lossy(&data).to_string()
}
