// ABOUTME: Container entrypoint - reads ContainerInput from stdin and streams framed results to stdout.
// ABOUTME: Logs go to stderr; stdout carries nothing but output records.

use anyhow::{Context, Result};
use corral_agent::{create_backend, runner, ContainerInput, ContainerOutput, RunnerConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

async fn read_input() -> Result<ContainerInput> {
    let mut raw = String::new();
    tokio::io::stdin()
        .read_to_string(&mut raw)
        .await
        .context("Failed to read stdin")?;
    serde_json::from_str(&raw).context("Failed to parse ContainerInput from stdin")
}

async fn fail(message: String) {
    let record = match corral_agent::framing::encode(&ContainerOutput::error(message, None)) {
        Ok(record) => record,
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode error record");
            return;
        }
    };
    let mut stdout = tokio::io::stdout();
    let _ = stdout.write_all(record.as_bytes()).await;
    let _ = stdout.flush().await;
}

async fn shutdown_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    tracing::warn!("Shutdown signal received, aborting query");
    cancel.cancel();
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = match RunnerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "Invalid runner configuration");
            fail(format!("{e:#}")).await;
            std::process::exit(1);
        }
    };

    let input = match read_input().await {
        Ok(input) => input,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "Invalid input");
            fail(format!("{e:#}")).await;
            std::process::exit(1);
        }
    };

    let backend = match create_backend(&config) {
        Ok(backend) => backend,
        Err(e) => {
            fail(format!("{e:#}")).await;
            std::process::exit(1);
        }
    };

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    let mut stdout = tokio::io::stdout();
    match runner::run(backend.as_ref(), &config, input, cancel, &mut stdout).await {
        Ok(records) => {
            tracing::info!(records, "Runner finished");
        }
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "Runner failed");
            std::process::exit(1);
        }
    }
}
