//! # Comprova Watcher
//!
//! Daemon entry point. Watches the receipt inbox, drives each scan through
//! the reconciliation pipeline, and sweeps the quarantine folder on a
//! schedule. OCR and portal submission are delegated to external programs
//! configured as collaborators.

mod adapters;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use comprova_core::retry::RetryController;
use comprova_core::watch::InboxWatcher;
use comprova_core::{AppConfig, Ledger, Reconciler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::adapters::{CommandExtractor, CommandSubmitter, JsonItinerarySource};

#[derive(Parser, Debug)]
#[command(name = "comprova-watcher")]
#[command(about = "Receipt reconciliation daemon: watch, match, submit, never twice")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the inbox directory.
    #[arg(long)]
    inbox: Option<PathBuf>,

    /// Override the archive directory for committed/duplicate receipts.
    #[arg(long)]
    archive: Option<PathBuf>,

    /// Override the quarantine directory for failed receipts.
    #[arg(long)]
    quarantine: Option<PathBuf>,

    /// Override the quarantine sweep cadence, e.g. "5m" or "90s".
    /// "0s" disables the sweep.
    #[arg(long, value_parser = humantime::parse_duration)]
    retry_interval: Option<Duration>,

    /// Drain the inbox and run one quarantine sweep, then exit.
    #[arg(long)]
    once: bool,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(cli: &Cli) -> anyhow::Result<AppConfig> {
    let mut config = AppConfig::load(cli.config.as_deref())
        .context("failed to load configuration")?;
    if let Some(inbox) = &cli.inbox {
        config.folders.inbox = inbox.clone();
    }
    if let Some(archive) = &cli.archive {
        config.folders.archive = archive.clone();
    }
    if let Some(quarantine) = &cli.quarantine {
        config.folders.quarantine = quarantine.clone();
    }
    if let Some(interval) = cli.retry_interval {
        config.retry.interval_secs = interval.as_secs();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let ocr_command = config
        .collaborators
        .ocr_command
        .clone()
        .context("collaborators.ocr_command is required")?;
    let submit_command = config
        .collaborators
        .submit_command
        .clone()
        .context("collaborators.submit_command is required")?;
    let itinerary_path = config
        .collaborators
        .itinerary_path
        .clone()
        .context("collaborators.itinerary_path is required")?;

    let folders = config.receipt_folders();
    folders.ensure().context("failed to create work folders")?;

    let ledger = Arc::new(
        Ledger::open(&config.ledger.path)
            .await
            .with_context(|| format!("failed to open ledger {}", config.ledger.path.display()))?,
    );

    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&ledger),
        Arc::new(CommandExtractor::new(ocr_command)),
        Arc::new(JsonItinerarySource::new(itinerary_path)),
        Arc::new(CommandSubmitter::new(submit_command)),
        folders,
    ));

    let watcher = InboxWatcher::new(Arc::clone(&reconciler), config.watch_config());
    let retry = RetryController::new(Arc::clone(&reconciler), config.retry_settings());

    if cli.once {
        let inbox_report = watcher.process_existing().await?;
        info!(
            processed = inbox_report.processed,
            committed = inbox_report.committed,
            duplicates = inbox_report.duplicates,
            quarantined = inbox_report.quarantined,
            "inbox drained"
        );
        let retry_report = retry.run_once().await?;
        info!(
            processed = retry_report.processed,
            deferred = retry_report.deferred,
            exhausted = retry_report.exhausted,
            "quarantine swept"
        );
        ledger.close().await;
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(error = %err, "failed to listen for ctrl-c");
                return;
            }
            info!("ctrl-c received; finishing the receipt in flight");
            shutdown.cancel();
        });
    }

    let retry_interval = config.retry_interval();
    let retry_task = retry_interval.map(|interval| {
        let shutdown = shutdown.clone();
        info!(interval_secs = interval.as_secs(), "quarantine sweep enabled");
        tokio::spawn(async move { retry.run_forever(interval, shutdown).await })
    });
    if retry_task.is_none() {
        warn!("quarantine sweep disabled (retry.interval_secs = 0)");
    }

    let watch_result = watcher.run(shutdown.clone()).await;
    shutdown.cancel();

    if let Some(task) = retry_task {
        if let Err(err) = task.await {
            error!(error = %err, "retry task panicked");
        }
    }

    ledger.close().await;
    watch_result.context("inbox watcher failed")?;
    info!("comprova-watcher stopped cleanly");
    Ok(())
}
