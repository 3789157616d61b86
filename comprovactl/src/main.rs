//! # comprovactl
//!
//! Admin CLI for the comprova dedup ledger: inspect, search, delete, purge
//! and vacuum without touching the running watcher.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use comprova_core::AppConfig;
use comprova_core::ledger::{Ledger, PhysicalRecord, PurgeScope, SemanticRecord};
use dialoguer::Confirm;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "comprovactl")]
#[command(about = "Inspect and maintain the comprova dedup ledger")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Ledger database path (overrides the configured one).
    #[arg(long)]
    ledger: Option<PathBuf>,

    /// Skip confirmation prompts.
    #[arg(long, short = 'y')]
    yes: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List physical receipt records (newest first)
    List {
        /// Cap the number of rows shown.
        #[arg(long)]
        limit: Option<u32>,
    },
    /// List semantic transaction records (newest first)
    ListSem {
        #[arg(long)]
        limit: Option<u32>,
    },
    /// Search physical records by hash or filename fragment
    Find { term: String },
    /// Search semantic records by kind or minute fragment
    FindSem { term: String },
    /// Delete physical records matching a hash or filename fragment
    Delete { term: String },
    /// Delete semantic records matching a kind or minute fragment
    DeleteSem { term: String },
    /// Show row counts and the most recent commit per table
    Stats,
    /// Remove records older than a cutoff
    Purge {
        /// Age cutoff in days.
        #[arg(long, default_value_t = 180)]
        days: u32,
        /// Which table to purge.
        #[arg(long, value_enum, default_value_t = ScopeArg::Both)]
        scope: ScopeArg,
    },
    /// Reclaim file space after deletions
    Vacuum,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum ScopeArg {
    Physical,
    Semantic,
    Both,
}

impl From<ScopeArg> for PurgeScope {
    fn from(scope: ScopeArg) -> Self {
        match scope {
            ScopeArg::Physical => PurgeScope::Physical,
            ScopeArg::Semantic => PurgeScope::Semantic,
            ScopeArg::Both => PurgeScope::Both,
        }
    }
}

fn print_physical(rows: &[PhysicalRecord]) {
    if rows.is_empty() {
        println!("no physical records");
        return;
    }
    println!(
        "{:<16}  {:<32}  {:<8}  {:<16}  {:>10}  {}",
        "HASH", "FILENAME", "KIND", "STAMP", "AMOUNT", "COMMITTED"
    );
    for row in rows {
        let short_hash = &row.hash[..row.hash.len().min(16)];
        println!(
            "{:<16}  {:<32}  {:<8}  {:<16}  {:>10}  {}",
            short_hash, row.filename, row.kind, row.stamp, row.amount_minor, row.created_at
        );
    }
    println!("{} row(s)", rows.len());
}

fn print_semantic(rows: &[SemanticRecord]) {
    if rows.is_empty() {
        println!("no semantic records");
        return;
    }
    println!(
        "{:<8}  {:<16}  {:>10}  {}",
        "KIND", "MINUTE", "AMOUNT", "COMMITTED"
    );
    for row in rows {
        println!(
            "{:<8}  {:<16}  {:>10}  {}",
            row.kind, row.stamp_minute, row.amount_minor, row.created_at
        );
    }
    println!("{} row(s)", rows.len());
}

fn confirm_or_abort(skip: bool, prompt: &str) -> anyhow::Result<bool> {
    if skip {
        return Ok(true);
    }
    let confirmed = Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()?;
    if !confirmed {
        println!("cancelled");
    }
    Ok(confirmed)
}

async fn open_ledger(cli: &Cli) -> anyhow::Result<Ledger> {
    let path = match &cli.ledger {
        Some(path) => path.clone(),
        None => {
            AppConfig::load(cli.config.as_deref())
                .context("failed to load configuration")?
                .ledger
                .path
        }
    };
    Ledger::open(&path)
        .await
        .with_context(|| format!("failed to open ledger {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();
    let ledger = open_ledger(&cli).await?;

    match &cli.command {
        Command::List { limit } => {
            print_physical(&ledger.list_physical(*limit).await?);
        }
        Command::ListSem { limit } => {
            print_semantic(&ledger.list_semantic(*limit).await?);
        }
        Command::Find { term } => {
            print_physical(&ledger.find_physical(term).await?);
        }
        Command::FindSem { term } => {
            print_semantic(&ledger.find_semantic(term).await?);
        }
        Command::Delete { term } => {
            let matches = ledger.find_physical(term).await?;
            if matches.is_empty() {
                println!("nothing matches '{term}'");
            } else {
                print_physical(&matches);
                let prompt = format!(
                    "Delete {} physical record(s)? Those receipts become submittable again.",
                    matches.len()
                );
                if confirm_or_abort(cli.yes, &prompt)? {
                    let removed = ledger.delete_physical(term).await?;
                    warn!(term = %term, removed, "physical ledger records deleted");
                    println!("deleted {removed} record(s)");
                }
            }
        }
        Command::DeleteSem { term } => {
            let matches = ledger.find_semantic(term).await?;
            if matches.is_empty() {
                println!("nothing matches '{term}'");
            } else {
                print_semantic(&matches);
                let prompt = format!(
                    "Delete {} semantic record(s)? Those transactions become submittable again.",
                    matches.len()
                );
                if confirm_or_abort(cli.yes, &prompt)? {
                    let removed = ledger.delete_semantic(term).await?;
                    warn!(term = %term, removed, "semantic ledger records deleted");
                    println!("deleted {removed} record(s)");
                }
            }
        }
        Command::Stats => {
            let stats = ledger.stats().await?;
            println!("physical rows: {}", stats.physical_rows);
            println!("semantic rows: {}", stats.semantic_rows);
            println!(
                "last physical commit: {}",
                stats.last_physical.as_deref().unwrap_or("-")
            );
            println!(
                "last semantic commit: {}",
                stats.last_semantic.as_deref().unwrap_or("-")
            );
        }
        Command::Purge { days, scope } => {
            let prompt = format!(
                "Purge {scope:?} records older than {days} day(s)? Matching receipts become submittable again."
            );
            if confirm_or_abort(cli.yes, &prompt)? {
                let removed = ledger.purge(*days, PurgeScope::from(*scope)).await?;
                warn!(days, scope = ?scope, removed, "ledger purged");
                println!("purged {removed} record(s)");
            }
        }
        Command::Vacuum => {
            ledger.vacuum().await?;
            println!("vacuum complete");
        }
    }

    ledger.close().await;
    Ok(())
}
