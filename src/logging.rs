use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::error::TrickleError;

/// `RUST_LOG` wins when set; otherwise `level` (e.g. "info", "trickle=debug").
pub fn build_filter(level: &str) -> Result<EnvFilter, TrickleError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(level)
            .map_err(|e| TrickleError::Config(format!("invalid log level {level:?}: {e}"))),
    }
}

/// Install the process-wide subscriber. Logs go to stderr (stdout carries the
/// streamed completion) and, when `log_file` is set, are appended there too.
pub fn init(level: &str, log_file: Option<&Path>) -> Result<(), TrickleError> {
    let filter = build_filter(level)?;

    let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_ansi(false);

    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| {
                    TrickleError::Config(format!("cannot open log file {}: {e}", path.display()))
                })?;
            Some(
                fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_ansi(false)
                    .with_target(true),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| TrickleError::Other(format!("logging already initialised: {e}")))
}
