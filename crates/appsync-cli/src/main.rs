use std::path::PathBuf;

use anyhow::{Context, Result};
use appsync_core::Candidate;
use appsync_storage::{CatalogStore, JsonFileProgressStore, PgCatalogStore, ProgressStore};
use appsync_sync::{maybe_build_scheduler, RunStatus, SyncConfig, SyncEngine};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "appsync")]
#[command(about = "Resumable app catalog sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one gated sync invocation.
    Sync,
    /// Create the catalog tables.
    Migrate,
    /// Print the saved checkpoint.
    Status,
    /// Delete the saved checkpoint so the next run starts a fresh pass.
    Reset,
    /// Append candidates from a JSON array file to the traversal list.
    Import { path: PathBuf },
    /// Run sync on the configured cron schedule until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("appsync=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let engine = SyncEngine::connect(&config).await?;
            let summary = engine.run_once(Utc::now()).await?;
            match summary.status {
                RunStatus::Denied(reason) => println!("sync skipped: {reason}"),
                RunStatus::Completed { audit, last_cursor } => println!(
                    "sync complete: run_id={} last_cursor={:?} inserted={} updated={} unchanged={} deleted={}",
                    summary.run_id,
                    last_cursor,
                    audit.inserted_count,
                    audit.updated_count,
                    audit.no_change_count,
                    audit.deleted_count
                ),
                RunStatus::Suspended {
                    cursor,
                    runs_this_period,
                } => println!(
                    "sync suspended: run_id={} cursor={:?} runs_this_period={}",
                    summary.run_id, cursor, runs_this_period
                ),
            }
        }
        Commands::Migrate => {
            let store = PgCatalogStore::connect(&config.database_url)
                .await
                .context("connecting to catalog database")?;
            let result = store.ensure_schema().await;
            store.close().await;
            result?;
            println!("catalog schema ready");
        }
        Commands::Status => {
            let progress = JsonFileProgressStore::new(config.progress_path.clone())
                .load()
                .await?;
            println!("{}", serde_json::to_string_pretty(&progress)?);
        }
        Commands::Reset => {
            JsonFileProgressStore::new(config.progress_path.clone())
                .clear()
                .await?;
            println!("checkpoint cleared: {}", config.progress_path.display());
        }
        Commands::Import { path } => {
            let text = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let candidates: Vec<Candidate> = serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            let store = PgCatalogStore::connect(&config.database_url)
                .await
                .context("connecting to catalog database")?;
            let result = store.import_candidates(&candidates).await;
            store.close().await;
            println!("imported {} of {} candidates", result?, candidates.len());
        }
        Commands::Schedule => {
            let Some(sched) = maybe_build_scheduler(&config).await? else {
                anyhow::bail!("scheduler disabled; set APPSYNC_SCHEDULER_ENABLED=1");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler running");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
        }
    }

    Ok(())
}
