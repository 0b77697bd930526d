use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};

/// Durable record of the most recent response.
///
/// Each attempt truncates and reopens the text file, so the file only ever
/// holds the output of a single attempt. A JSON summary is written next to
/// it once the call settles.
#[derive(Debug, Clone)]
pub struct Transcript {
    path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSummary {
    pub model: String,
    pub provider: String,
    /// "complete", "timed_out", "failed", or "error".
    pub outcome: String,
    pub error: Option<String>,
    pub attempts: u32,
    pub elapsed_ms: u64,
    pub chars: usize,
    pub finished_at_ms: u64,
}

impl Transcript {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `last_response.txt` -> `last_response.summary.json`.
    pub fn summary_path(&self) -> PathBuf {
        self.path.with_extension("summary.json")
    }

    /// Fresh, empty sink for one attempt.
    pub async fn open_attempt(&self) -> std::io::Result<File> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
            .await
    }

    /// Atomic write: temp file + rename prevents partial reads.
    pub async fn write_summary(&self, summary: &TranscriptSummary) -> std::io::Result<PathBuf> {
        let path = self.summary_path();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }

        let json = serde_json::to_string_pretty(summary).map_err(std::io::Error::other)?;

        let tmp_path = path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, json.as_bytes()).await?;
        if let Err(e) = tokio::fs::rename(&tmp_path, &path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e);
        }
        Ok(path)
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
