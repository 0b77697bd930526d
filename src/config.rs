use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::TrickleError;
use crate::retry::RetryPolicy;

pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1/chat/completions";
pub const DEFAULT_TRANSCRIPT: &str = ".trickle/last_response.txt";
pub const CONFIG_FILE_NAME: &str = "trickle.toml";

/// Hard ceiling on the per-call budget. Keeps `Instant + timeout` far from overflow.
pub const MAX_TIMEOUT_SECS: u64 = 3600;

/// Backoff envelope and attempt budget.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
        }
    }
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub model: String,
    pub temperature: f64,
    pub timeout_secs: u64,
    pub base_url: String,
    /// Never read from the config file; only from `OPENAI_API_KEY`.
    #[serde(skip)]
    pub api_key: Option<String>,
    pub retry: RetrySettings,
    /// Treat a timed-out attempt as retryable. Off by default.
    pub retry_on_timeout: bool,
    pub transcript_path: PathBuf,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    /// TOML file the values were loaded from, if any.
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.7,
            timeout_secs: 60,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            retry: RetrySettings::default(),
            retry_on_timeout: false,
            transcript_path: PathBuf::from(DEFAULT_TRANSCRIPT),
            log_level: "info".to_string(),
            log_file: None,
            source: None,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("timeout_secs", &self.timeout_secs)
            .field("base_url", &self.base_url)
            .field(
                "api_key",
                &self.api_key.as_ref().map(|_| "[REDACTED]"),
            )
            .field("retry", &self.retry)
            .field("retry_on_timeout", &self.retry_on_timeout)
            .field("transcript_path", &self.transcript_path)
            .field("log_level", &self.log_level)
            .field("log_file", &self.log_file)
            .field("source", &self.source)
            .finish()
    }
}

impl Config {
    /// Defaults, then the TOML file (explicit path, `TRICKLE_CONFIG`, or
    /// `./trickle.toml` if present), then `TRICKLE_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, TrickleError> {
        let file = path
            .map(Path::to_path_buf)
            .or_else(|| env::var_os("TRICKLE_CONFIG").map(PathBuf::from))
            .or_else(|| {
                let local = PathBuf::from(CONFIG_FILE_NAME);
                local.exists().then_some(local)
            });

        // Logging is not up yet; the caller reports `source` once it is.
        let mut config = match file {
            Some(p) => {
                let raw = std::fs::read_to_string(&p).map_err(|e| {
                    TrickleError::Config(format!("cannot read {}: {e}", p.display()))
                })?;
                let mut config = Self::from_toml_str(&raw)?;
                config.source = Some(p);
                config
            }
            None => Self::default(),
        };

        config.apply_env(|key| env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, TrickleError> {
        toml::from_str(raw).map_err(|e| TrickleError::Config(format!("invalid TOML: {e}")))
    }

    /// Apply `TRICKLE_*` overrides and `OPENAI_API_KEY`. `lookup` abstracts the
    /// environment so tests do not mutate process state.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), TrickleError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("TRICKLE_MODEL").filter(|v| !v.trim().is_empty()) {
            self.model = v;
        }
        if let Some(v) = lookup("TRICKLE_BASE_URL").filter(|v| !v.trim().is_empty()) {
            self.base_url = v;
        }
        if let Some(v) = lookup("TRICKLE_TEMPERATURE") {
            self.temperature = parse_var("TRICKLE_TEMPERATURE", &v)?;
        }
        if let Some(v) = lookup("TRICKLE_TIMEOUT_SECS") {
            self.timeout_secs = parse_var("TRICKLE_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("TRICKLE_MAX_RETRIES") {
            self.retry.max_retries = parse_var("TRICKLE_MAX_RETRIES", &v)?;
        }
        if let Some(v) = lookup("TRICKLE_BASE_DELAY_MS") {
            self.retry.base_delay_ms = parse_var("TRICKLE_BASE_DELAY_MS", &v)?;
        }
        if let Some(v) = lookup("TRICKLE_MAX_DELAY_MS") {
            self.retry.max_delay_ms = parse_var("TRICKLE_MAX_DELAY_MS", &v)?;
        }
        if let Some(v) = lookup("TRICKLE_RETRY_ON_TIMEOUT") {
            self.retry_on_timeout = parse_var("TRICKLE_RETRY_ON_TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("TRICKLE_TRANSCRIPT").filter(|v| !v.trim().is_empty()) {
            self.transcript_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("TRICKLE_LOG_LEVEL").filter(|v| !v.trim().is_empty()) {
            self.log_level = v;
        }
        if let Some(v) = lookup("TRICKLE_LOG_FILE").filter(|v| !v.trim().is_empty()) {
            self.log_file = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("OPENAI_API_KEY").filter(|v| !v.trim().is_empty()) {
            self.api_key = Some(v);
        }
        Ok(())
    }

    /// Reject values the runner or retry policy would refuse later.
    pub fn validate(&self) -> Result<(), TrickleError> {
        if self.model.trim().is_empty() {
            return Err(TrickleError::Config("model must not be empty".to_string()));
        }
        match reqwest::Url::parse(&self.base_url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            Ok(url) => {
                return Err(TrickleError::Config(format!(
                    "base_url must be http or https, got {}",
                    url.scheme()
                )));
            }
            Err(e) => {
                return Err(TrickleError::Config(format!(
                    "invalid base_url {:?}: {e}",
                    self.base_url
                )));
            }
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(TrickleError::Config(format!(
                "temperature must be within 0.0..=2.0, got {}",
                self.temperature
            )));
        }
        if self.timeout_secs == 0 || self.timeout_secs > MAX_TIMEOUT_SECS {
            return Err(TrickleError::Config(format!(
                "timeout_secs must be within 1..={MAX_TIMEOUT_SECS}, got {}",
                self.timeout_secs
            )));
        }
        RetryPolicy::from_settings(&self.retry)
            .map_err(|e| TrickleError::Config(e.to_string()))?;
        Ok(())
    }

    /// API key, or a configuration error naming the variable to set.
    pub fn require_api_key(&self) -> Result<&str, TrickleError> {
        self.api_key.as_deref().ok_or_else(|| {
            TrickleError::Config("no API key found, set OPENAI_API_KEY".to_string())
        })
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, TrickleError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| TrickleError::Config(format!("{key}={value:?}: {e}")))
}
