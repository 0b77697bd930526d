use std::path::PathBuf;

use clap::Parser;
use tokio::io::AsyncReadExt;

use crate::config::Config;
use crate::error::TrickleError;

/// Stream a chat completion under a deadline, retrying transient failures.
#[derive(Debug, Parser)]
#[command(name = "trickle", version)]
pub struct Cli {
    /// Prompt text. Reads stdin when neither this nor --prompt-file is given.
    #[arg(short, long, conflicts_with = "prompt_file")]
    pub prompt: Option<String>,

    /// Read the prompt from a file.
    #[arg(short = 'f', long)]
    pub prompt_file: Option<PathBuf>,

    #[arg(short, long)]
    pub model: Option<String>,

    #[arg(short, long)]
    pub temperature: Option<f64>,

    /// Upper bound on request + streaming time.
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    /// Attempts before giving up on transient failures.
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Also retry attempts that hit the deadline.
    #[arg(long)]
    pub retry_on_timeout: bool,

    /// TOML config file (default: $TRICKLE_CONFIG or ./trickle.toml).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Where the streamed text is persisted.
    #[arg(long)]
    pub transcript: Option<PathBuf>,

    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Do not echo fragments to stdout.
    #[arg(long)]
    pub no_echo: bool,
}

impl Cli {
    /// Flags override file and environment values.
    pub fn apply(&self, config: &mut Config) {
        if let Some(ref model) = self.model {
            config.model = model.clone();
        }
        if let Some(t) = self.temperature {
            config.temperature = t;
        }
        if let Some(secs) = self.timeout_secs {
            config.timeout_secs = secs;
        }
        if let Some(n) = self.max_retries {
            config.retry.max_retries = n;
        }
        if self.retry_on_timeout {
            config.retry_on_timeout = true;
        }
        if let Some(ref path) = self.transcript {
            config.transcript_path = path.clone();
        }
        if let Some(ref path) = self.log_file {
            config.log_file = Some(path.clone());
        }
    }

    /// Resolve the prompt from --prompt, --prompt-file, or stdin.
    pub async fn read_prompt(&self) -> Result<String, TrickleError> {
        let prompt = if let Some(ref p) = self.prompt {
            p.clone()
        } else if let Some(ref path) = self.prompt_file {
            tokio::fs::read_to_string(path).await.map_err(|e| {
                TrickleError::InvalidRequest(format!(
                    "cannot read prompt file {}: {e}",
                    path.display()
                ))
            })?
        } else {
            let mut buf = String::new();
            tokio::io::stdin()
                .read_to_string(&mut buf)
                .await
                .map_err(|e| TrickleError::InvalidRequest(format!("cannot read stdin: {e}")))?;
            buf
        };

        if prompt.trim().is_empty() {
            return Err(TrickleError::InvalidRequest("prompt is empty".to_string()));
        }
        Ok(prompt)
    }
}
