//! reel-send - Scheduler daemon for due video posts
//!
//! Invokes the scheduler trigger on a fixed interval, publishing every
//! sub-post whose scheduled time has passed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use libreelcast::logging::{LogFormat, LoggingConfig};
use libreelcast::service::{BatchSummary, ReelcastService, TriggerCredentials};
use libreelcast::{Config, ReelcastError};
use tokio::time::{sleep, Duration};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "reel-send")]
#[command(version)]
#[command(about = "Scheduler daemon that publishes due video posts")]
#[command(long_about = "\
reel-send - Scheduler daemon that publishes due video posts

DESCRIPTION:
    reel-send invokes the Reelcast scheduler trigger at a fixed interval.
    Each run picks up to `scheduler.batch_size` platform sub-posts whose
    scheduled time has passed, oldest first, publishes them through the
    vendor adapters (`scheduler.concurrency` at a time) and reconciles the
    parent post status.

    A failure on one sub-post never stops the rest of the batch.

USAGE:
    # Run in foreground (logs to stderr)
    reel-send

    # Run with custom poll interval
    reel-send --poll-interval 30

    # Process one batch, print its summary as JSON and exit
    reel-send --once

AUTHENTICATION:
    In production the trigger requires the scheduler secret as a bearer
    token. Pass it with --token or REELCAST_TRIGGER_TOKEN.

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (finishes the current batch)

CONFIGURATION:
    Configuration file: ~/.config/reelcast/config.toml
    Database location: ~/.local/share/reelcast/reelcast.db

    [scheduler]
    environment = \"production\"
    batch_size = 10      # sub-posts per run
    concurrency = 4      # sub-posts attempted at once
    poll_interval = 60   # seconds between runs

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    2 - Configuration or authentication error
")]
struct Cli {
    /// Poll interval in seconds (overrides config)
    #[arg(long, value_name = "SECONDS")]
    poll_interval: Option<u64>,

    /// Bearer token presented to the scheduler trigger
    #[arg(long, env = "REELCAST_TRIGGER_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Log output format: text, json or pretty
    #[arg(long, env = "REELCAST_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    verbose: bool,

    /// Process due posts once and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    LoggingConfig::from_env(cli.verbose)
        .with_format(cli.log_format)
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(exit_code(&e));
    }
}

fn exit_code(error: &anyhow::Error) -> i32 {
    error
        .downcast_ref::<ReelcastError>()
        .map(ReelcastError::exit_code)
        .unwrap_or(1)
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load()?;
    let poll_interval = cli.poll_interval.unwrap_or(config.scheduler.poll_interval);
    let service = ReelcastService::from_config(config).await?;

    info!("reel-send daemon starting");
    info!("Poll interval: {}s", poll_interval);

    let credentials = cli
        .token
        .as_deref()
        .map(TriggerCredentials::bearer)
        .unwrap_or_default();
    service.scheduler().authorize(&credentials)?;

    if cli.once {
        let summary = run_batch(&service).await?;
        println!(
            "{}",
            serde_json::to_string_pretty(&summary).context("Failed to encode batch summary")?
        );
        info!("reel-send: processed due posts once, exiting");
    } else {
        let shutdown = Arc::new(AtomicBool::new(false));
        setup_signal_handlers(shutdown.clone())?;
        run_daemon_loop(&service, poll_interval, shutdown).await;
    }

    info!("reel-send daemon stopped");
    Ok(())
}

/// Set up signal handlers for graceful shutdown
#[cfg(unix)]
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> anyhow::Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM]).context("Signal setup failed")?;

    std::thread::spawn(move || {
        if signals.forever().next().is_some() {
            info!("Received shutdown signal, stopping after the current batch");
            shutdown.store(true, Ordering::Relaxed);
        }
    });

    Ok(())
}

#[cfg(not(unix))]
fn setup_signal_handlers(_shutdown: Arc<AtomicBool>) -> anyhow::Result<()> {
    Ok(())
}

async fn run_daemon_loop(service: &ReelcastService, poll_interval: u64, shutdown: Arc<AtomicBool>) {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            info!("Shutdown requested, stopping daemon loop");
            break;
        }

        if let Err(e) = run_batch(service).await {
            error!("Error processing due posts: {}", e);
        }

        // Sleep until the next poll, checking for shutdown every second
        for _ in 0..poll_interval {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            sleep(Duration::from_secs(1)).await;
        }
    }
}

async fn run_batch(service: &ReelcastService) -> libreelcast::Result<BatchSummary> {
    let now = chrono::Utc::now().timestamp();
    let summary = service.scheduler().run(now).await?;

    if summary.processed > 0 {
        info!(
            processed = summary.processed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            "scheduler batch finished"
        );
    }

    Ok(summary)
}
