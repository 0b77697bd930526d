use std::process::ExitCode;

use clap::Parser;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use trickle::cli::Cli;
use trickle::config::Config;
use trickle::dispatch::CompletionRequest;
use trickle::dispatch::http::HttpChannel;
use trickle::retry::RetryPolicy;
use trickle::runner::{CompletionOutcome, ObserverEvent, StreamingCompletionRunner};
use trickle::session::CompletionSession;
use trickle::transcript::Transcript;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Load .env from the binary's directory first, then fall back to CWD.
    let exe_env = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(".env")))
        .filter(|path| path.exists());
    match exe_env {
        Some(path) => {
            dotenvy::from_path(&path).ok();
        }
        None => {
            dotenvy::dotenv().ok();
        }
    }

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    cli.apply(&mut config);

    trickle::logging::init(&config.log_level, config.log_file.as_deref())?;
    if let Some(ref path) = config.source {
        tracing::debug!(path = %path.display(), "loaded config file");
    }
    config.validate()?;

    tracing::debug!(?config, "configuration resolved");

    let prompt = cli.read_prompt().await?;
    let request = CompletionRequest::new(
        config.model.clone(),
        prompt,
        config.temperature,
        config.timeout(),
    )?;

    let channel = HttpChannel::from_config(&config)?;

    let token = CancellationToken::new();
    {
        let token = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received, stopping");
                token.cancel();
            }
        });
    }

    let mut runner = StreamingCompletionRunner::new().with_cancellation(token.clone());
    let echo = if cli.no_echo {
        None
    } else {
        let (tx, mut rx) = mpsc::unbounded_channel::<ObserverEvent>();
        runner = runner.with_observer(tx);
        Some(tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            let mut echoed = false;
            while let Some(event) = rx.recv().await {
                match event {
                    ObserverEvent::AttemptStarted(attempt) if attempt > 1 => {
                        // Earlier output is superseded; start the new attempt on a fresh line.
                        if echoed {
                            let _ = stdout.write_all(b"\n").await;
                            let _ = stdout.flush().await;
                            echoed = false;
                        }
                        eprintln!("retrying (attempt {attempt}), previous output discarded");
                    }
                    ObserverEvent::AttemptStarted(_) => {}
                    ObserverEvent::Fragment(fragment) => {
                        let _ = stdout.write_all(fragment.as_bytes()).await;
                        let _ = stdout.flush().await;
                        echoed = true;
                    }
                }
            }
        }))
    };

    let policy = RetryPolicy::from_settings(&config.retry)?.with_cancellation(token);
    let session = CompletionSession::new(
        channel,
        runner,
        policy,
        Transcript::new(&config.transcript_path),
    )
    .retry_on_timeout(config.retry_on_timeout);

    tracing::info!(model = %config.model, "trickle starting");

    let result = session.complete(&request).await;

    // Dropping the session closes the observer channel so the echo task drains and exits.
    drop(session);
    if let Some(handle) = echo {
        let _ = handle.await;
        println!();
    }

    match result {
        Ok(done) => {
            let attempts = done.report.attempt_count();
            match done.outcome {
                CompletionOutcome::Complete { text } => {
                    tracing::info!(
                        attempts,
                        chars = text.len(),
                        elapsed_ms = done.elapsed.as_millis() as u64,
                        "completion finished"
                    );
                    Ok(ExitCode::SUCCESS)
                }
                CompletionOutcome::TimedOut { partial, elapsed } => {
                    tracing::warn!(
                        attempts,
                        chars = partial.len(),
                        elapsed_ms = elapsed.as_millis() as u64,
                        "timed out, partial response kept in {}",
                        config.transcript_path.display()
                    );
                    Ok(ExitCode::SUCCESS)
                }
                CompletionOutcome::Failed { error, partial } => {
                    tracing::error!(attempts, chars = partial.len(), "completion failed: {error}");
                    eprintln!("error: {}", error.user_message());
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Err(e) => {
            tracing::error!(kind = e.kind(), "completion failed: {e}");
            eprintln!("error: {}", e.user_message());
            Ok(ExitCode::FAILURE)
        }
    }
}
