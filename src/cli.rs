//! Command line entry point: `collect` and `status`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::collector::{
    CheckpointStore, CollectOptions, CollectionOrchestrator, CollectionOutcome, CollectionPolicy,
    LoggingNotifier, LoggingProgressObserver, ParallelOrchestrator, RateLimiter,
};
use crate::domain::{CollectionStore, PhoneSource, StoreProvider};
use crate::infrastructure::{
    AppConfig, ConfigManager, DataMasterClient, MemoryStore, SqlitePhoneStore, init_logging_with_config,
};

#[derive(Debug, Parser)]
#[command(name = "datamaster-collector", version)]
#[command(about = "Collects client project phone numbers from the DataMaster API into SQLite")]
pub struct Cli {
    /// Config file; defaults to the per-user config directory
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run (or continue) a collection
    Collect(CollectArgs),
    /// Show database totals and recent runs
    Status(StatusArgs),
}

#[derive(Debug, Args)]
pub struct CollectArgs {
    /// Only the first N clients
    #[arg(long, value_name = "N")]
    pub limit_clients: Option<usize>,

    /// Only the first N projects of each client
    #[arg(long, value_name = "N")]
    pub limit_projects: Option<usize>,

    /// Stop paginating a project after page N
    #[arg(long, value_name = "N")]
    pub max_pages: Option<u32>,

    /// Continue the run recorded in the state file
    #[arg(long = "continue")]
    pub resume: bool,

    /// Parallel client workers; 1 runs sequentially
    #[arg(long, value_name = "N")]
    pub workers: Option<usize>,

    /// Collect into memory only; nothing is written to the database
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Number of recent runs to list
    #[arg(long, default_value_t = 10)]
    pub runs: u32,
}

impl CollectArgs {
    #[must_use]
    pub fn options(&self) -> CollectOptions {
        CollectOptions {
            limit_clients: self.limit_clients,
            limit_projects: self.limit_projects,
            max_pages: self.max_pages,
            resume: self.resume,
        }
    }
}

pub async fn run(cli: Cli) -> Result<()> {
    let manager = match &cli.config {
        Some(path) => ConfigManager::with_path(path),
        None => ConfigManager::new()?,
    };
    let config = manager.load_effective().await?;
    init_logging_with_config(&config.logging)?;
    info!("Using configuration {:?}", manager.config_path());

    match cli.command {
        Command::Collect(args) => collect(&config, &args).await,
        Command::Status(args) => status(&config, &args).await,
    }
}

async fn collect(config: &AppConfig, args: &CollectArgs) -> Result<()> {
    config.validate_for_collection()?;

    let options = args.options();
    let workers = args.workers.unwrap_or(config.collection.workers).max(1);
    let source: Arc<dyn PhoneSource> = Arc::new(DataMasterClient::new(&config.api)?);
    let rate_limiter = Arc::new(RateLimiter::new(config.collection.rate_limit_delay()));

    let (store, stores, checkpoints): (Arc<dyn CollectionStore>, Arc<dyn StoreProvider>, CheckpointStore) =
        if args.dry_run {
            warn!("🧪 Dry run: collected data stays in memory");
            let memory = MemoryStore::new();
            let state_file = config.storage.state_file.with_extension("dry-run.json");
            (Arc::new(memory.clone()), Arc::new(memory), CheckpointStore::new(state_file))
        } else {
            let sqlite = SqlitePhoneStore::open(&config.storage.database_path, config.storage.max_connections)
                .await
                .context("Failed to open the phone database")?;
            (
                Arc::new(sqlite.clone()),
                Arc::new(sqlite),
                CheckpointStore::new(&config.storage.state_file),
            )
        };

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("⏹️ Interrupt received; finishing in-flight work before stopping");
            interrupt.cancel();
        }
    });

    let outcome = if workers > 1 {
        ParallelOrchestrator::new(source, stores, checkpoints, rate_limiter, workers)
            .with_policy(CollectionPolicy {
                checkpoint_interval: config.collection.parallel_checkpoint_interval,
                notify_interval: config.collection.notify_interval,
            })
            .with_progress_observer(Arc::new(LoggingProgressObserver))
            .with_notifier(Arc::new(LoggingNotifier))
            .collect(&options, &cancel)
            .await?
    } else {
        CollectionOrchestrator::new(source, store, checkpoints, rate_limiter)
            .with_policy(CollectionPolicy {
                checkpoint_interval: config.collection.checkpoint_interval,
                notify_interval: config.collection.notify_interval,
            })
            .with_progress_observer(Arc::new(LoggingProgressObserver))
            .with_notifier(Arc::new(LoggingNotifier))
            .collect(&options, &cancel)
            .await?
    };

    print_outcome(&outcome);
    Ok(())
}

fn print_outcome(outcome: &CollectionOutcome) {
    println!("Run {} {}", outcome.run_id, outcome.status);
    println!(
        "  clients:  {}/{}{}",
        outcome.clients_processed(),
        outcome.clients_in_scope,
        if outcome.resumed { " (resumed)" } else { "" }
    );
    println!("  projects: {}", outcome.stats.projects_count);
    println!("  phones:   {} seen, {} new", outcome.stats.total_phone_observations, outcome.stats.new_phones);
    println!("  errors:   {}", outcome.stats.error_count);
    println!("  elapsed:  {:.1}s", outcome.elapsed.as_secs_f64());
}

async fn status(config: &AppConfig, args: &StatusArgs) -> Result<()> {
    let store = SqlitePhoneStore::open(&config.storage.database_path, 1)
        .await
        .context("Failed to open the phone database")?;
    let summary = store.store_summary().await?;
    let runs = store.recent_runs(args.runs).await?;

    println!("Database: {}", config.storage.database_path.display());
    println!("  clients:  {}", summary.clients);
    println!("  projects: {}", summary.projects);
    println!("  phones:   {}", summary.phones);
    println!("  links:    {}", summary.links);

    if let Some(checkpoint) = CheckpointStore::new(&config.storage.state_file).load().await {
        println!(
            "Checkpoint: run {} at {}/{} clients (saved {})",
            checkpoint.run_id,
            checkpoint.processed_clients,
            checkpoint.total_clients_in_scope,
            checkpoint.saved_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    if !runs.is_empty() {
        println!("Recent runs:");
        for run in runs {
            let finished = run
                .completed_at
                .map_or_else(|| "-".to_string(), |at| at.format("%Y-%m-%d %H:%M:%S").to_string());
            println!(
                "  #{:<5} {:<9} started {}  finished {}  phones {} (new {})  errors {}",
                run.id,
                run.status.as_str(),
                run.started_at.format("%Y-%m-%d %H:%M:%S"),
                finished,
                run.total_phone_observations,
                run.new_phones,
                run.error_count
            );
        }
    }

    store.close().await;
    Ok(())
}
