use std::sync::Arc;

use anyhow::Result;
use binder_adapters::{PriceChartingAdapter, TcgdexAdapter};
use binder_core::{JobKind, TriggerKind};
use binder_storage::{PacedClient, PacedClientConfig, Store};
use binder_sync::{build_scheduler, SyncConfig, SyncService};
use binder_web::AppState;
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "binder-cli")]
#[command(about = "Binder command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the web surface with the background sync scheduler.
    Serve,
    /// Run one synchronization job to completion and print its summary.
    Sync {
        #[arg(long, value_parser = parse_kind)]
        kind: JobKind,
        /// Restrict the run to specific card ids (repeatable).
        #[arg(long = "card-id")]
        card_ids: Vec<i64>,
    },
    /// Apply the database schema and exit.
    Migrate,
}

fn parse_kind(input: &str) -> Result<JobKind, String> {
    JobKind::parse(input).ok_or_else(|| format!("unknown job kind '{input}' (pricing | metadata)"))
}

fn build_service(config: SyncConfig, store: Store) -> Result<Arc<SyncService>> {
    let pricing_client = Arc::new(PacedClient::new(PacedClientConfig {
        min_interval: config.min_interval(JobKind::Pricing),
        timeout: config.http_timeout,
        user_agent: config.user_agent.clone(),
    })?);
    let metadata_client = Arc::new(PacedClient::new(PacedClientConfig {
        min_interval: config.min_interval(JobKind::Metadata),
        timeout: config.http_timeout,
        user_agent: config.user_agent.clone(),
    })?);
    let pricing = Arc::new(PriceChartingAdapter::new(pricing_client, store.clone()));
    let metadata = Arc::new(TcgdexAdapter::new(metadata_client, store.clone()));
    Ok(SyncService::new(store, config, pricing, metadata))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Migrate => {
            let store = Store::connect(&config.database_url).await?;
            store.migrate().await?;
            println!("schema applied to {}", config.database_url);
        }
        Commands::Sync { kind, card_ids } => {
            let store = Store::connect(&config.database_url).await?;
            store.reconcile_interrupted_jobs().await?;
            let service = build_service(config, store)?;
            let card_ids = if card_ids.is_empty() {
                None
            } else {
                Some(card_ids)
            };
            let summary = service.run_now(kind, TriggerKind::Manual, card_ids).await?;
            println!(
                "sync complete: job_id={} kind={} status={} total={} processed={} succeeded={} failed={} duration_ms={}",
                summary.job_id,
                summary.kind,
                summary.status,
                summary.items_total,
                summary.items_processed,
                summary.items_succeeded,
                summary.items_failed,
                summary.duration_ms
            );
            if let Some(message) = summary.error_message {
                println!("  note: {message}");
            }
        }
        Commands::Serve => {
            let store = Store::connect(&config.database_url).await?;
            let reconciled = store.reconcile_interrupted_jobs().await?;
            if reconciled > 0 {
                info!(reconciled, "recovered from an unclean shutdown");
            }
            let service = build_service(config, store)?;
            if let Some(scheduler) = build_scheduler(Arc::clone(&service)).await? {
                scheduler.start().await?;
                info!("sync scheduler started");
            }
            binder_web::serve(AppState::new(service)).await?;
        }
    }

    Ok(())
}
