//! wakesched daemon.
//!
//! Loads the scheduler configuration, restores persisted tasks and runs the
//! scheduler until SIGTERM or Ctrl-C. Task notifications are written to the
//! log; embedders subscribe to them through the library instead.
//!
//! The daemon only replays tasks already in the state file. It registers
//! no tasks itself and has no power-manager integration, so it never sees
//! `Suspending` or `Resuming`: startup tasks and time-based tasks fire, but
//! wake-up tasks and wake-on-suspend need an embedding process that
//! publishes [`PowerEvent`]s on the bus passed to [`Scheduler::new`].

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;
use wakesched::{JsonFileStore, PowerEvent, Scheduler, SchedulerConfig, SchedulerStore};

/// Persistent task scheduler with suspend/resume wake-up support.
#[derive(Parser)]
#[command(name = "wakesched", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler over the persisted tasks until interrupted.
    Run,

    /// Print the persisted tasks and exit.
    List,

    /// Write the effective configuration to the config path and exit.
    InitConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(SchedulerConfig::default_config_path);

    let config = if config_path.exists() {
        SchedulerConfig::from_file(&config_path)?
    } else {
        SchedulerConfig::default()
    };

    // Keep the guard alive so buffered file logs are flushed on exit.
    let _log_guard = init_tracing(&config);

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::List => list(&config),
        Command::InitConfig => {
            config.save_to_file(&config_path)?;
            println!("{}", config_path.display());
            Ok(())
        }
    }
}

fn init_tracing(config: &SchedulerConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("wakesched=info"));
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let (file_layer, guard) = if config.log_to_file {
        let appender = tracing_appender::rolling::daily(wakesched::dirs::logs_dir(), "wakesched.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(writer);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
    guard
}

async fn run(config: SchedulerConfig) -> anyhow::Result<()> {
    info!("wakesched v{} starting", env!("CARGO_PKG_VERSION"));

    let store = JsonFileStore::new(config.resolved_state_path());
    info!(path = %store.path().display(), "using state file");

    // Nothing publishes here in the standalone daemon; see the module docs.
    let (power_tx, _) = broadcast::channel::<PowerEvent>(16);
    let scheduler = Scheduler::new(&config, store, power_tx);

    let mut events = scheduler.subscribe();
    let logger = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => info!(kind = ?event.kind(), "{}", event.task()),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "scheduler events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    scheduler.startup();
    wait_for_shutdown_signal().await?;
    info!("shutdown requested");
    scheduler.shutdown().await;

    drop(scheduler);
    if let Err(e) = logger.await {
        warn!("event logger ended abnormally: {e}");
    }
    info!("wakesched shut down cleanly");
    Ok(())
}

fn list(config: &SchedulerConfig) -> anyhow::Result<()> {
    let store = JsonFileStore::new(config.resolved_state_path());
    let state = store
        .load()
        .map_err(|e| anyhow::anyhow!("cannot read {}: {e}", store.path().display()))?;
    if state.tasks.is_empty() {
        println!("no tasks");
    }
    for task in &state.tasks {
        println!("{task}");
    }
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res?,
        _ = term.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
