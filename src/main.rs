// ABOUTME: Entry point for the corral operator CLI.
// ABOUTME: `serve` runs the health/intake server, `run` dispatches one container run, `status` prints health.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use corral::{logging, paths, server, Config, Dispatcher, SessionStore};
use corral_agent::{ContainerInput, OutputStatus};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "corral")]
#[command(about = "Run AI agent sessions in per-group containers", long_about = None)]
struct Cli {
    /// Also write JSON logs under the data directory
    #[arg(long, global = true)]
    log_file: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve /health, /metrics, and prompt intake
    Serve,
    /// Run one container for a group and stream its output records
    Run {
        /// Group folder name
        #[arg(long)]
        group: String,
        #[arg(long)]
        prompt: String,
        /// Ignore the stored session and start fresh
        #[arg(long)]
        fresh: bool,
        /// Mark the prompt as coming from a scheduled task
        #[arg(long)]
        scheduled: bool,
    },
    /// Print the health payload and stored sessions
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_dir = cli.log_file.then(paths::log_dir);
    let _log_guard = logging::init(log_dir.as_deref())?;

    let config = Arc::new(Config::load()?);
    tracing::info!(
        backend = %config.backend.backend_type,
        data_dir = %config.data_dir().display(),
        max_concurrent = config.container.max_concurrent,
        "Configuration loaded"
    );

    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Run {
            group,
            prompt,
            fresh,
            scheduled,
        } => run(config, &group, prompt, fresh, scheduled).await,
        Commands::Status => status(&config),
    }
}

async fn serve(config: Arc<Config>) -> Result<()> {
    let store = SessionStore::new(config.data_dir())?;
    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&config)).with_store(store));
    server::start_server(config, dispatcher).await
}

async fn run(config: Arc<Config>, group: &str, prompt: String, fresh: bool, scheduled: bool) -> Result<()> {
    let store = SessionStore::new(config.data_dir())?;
    if fresh && store.clear(group)? {
        tracing::info!(group = %group, "Starting a fresh session");
    }
    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&config)).with_store(store));

    // First Ctrl-C asks the container to finish its turn and exit
    let closer = {
        let dispatcher = Arc::clone(&dispatcher);
        let group = group.to_string();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!(group = %group, "Interrupted; requesting session close");
                if let Err(e) = dispatcher.close_session(&group).await {
                    tracing::warn!(group = %group, error = %e, "Failed to request close");
                }
            }
        })
    };

    let input = ContainerInput {
        prompt,
        is_scheduled_task: scheduled,
        ..Default::default()
    };
    let outcome = dispatcher
        .run(group, input, |output| match serde_json::to_string(output) {
            Ok(line) => println!("{line}"),
            Err(e) => tracing::warn!(error = %e, "Failed to print output record"),
        })
        .await;
    closer.abort();
    let outcome = outcome?;

    tracing::info!(
        group = %group,
        status = ?outcome.status(),
        records = outcome.records,
        duration_ms = outcome.duration.as_millis() as u64,
        "Run finished"
    );
    if outcome.status() != OutputStatus::Success {
        anyhow::bail!(
            "Run for '{}' failed: {}",
            group,
            outcome.output.error.as_deref().unwrap_or("no detail")
        );
    }
    Ok(())
}

fn status(config: &Config) -> Result<()> {
    let payload = server::health_payload(config, None);
    println!(
        "{}",
        serde_json::to_string_pretty(&payload).context("Failed to render health payload")?
    );

    let store = SessionStore::new(config.data_dir())?;
    for session in store.list()? {
        println!(
            "{}\t{}\t{}\t{}",
            session.group_folder, session.backend, session.session_id, session.updated_at
        );
    }
    Ok(())
}
