use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hpt_ingest::{load_watchlist, maybe_build_scheduler, IngestConfig, IngestService};
use hpt_provider::WebSearchClient;
use hpt_storage::{CatalogStore, PgStore, ResponseArchive};
use hpt_web::{AppState, TokenGate};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "hpt")]
#[command(about = "Home plan tracker command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion for a builder/community pair
    Ingest {
        company: String,
        community: String,
    },
    /// Re-ingest every enabled pair in watchlist.yaml
    Watch,
    /// Apply pending database migrations
    Migrate,
    /// Start the JSON API server
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = IngestConfig::from_env();

    match cli.command {
        Commands::Ingest { company, community } => {
            let service = build_service(&config).await?;
            let report = service.run(&company, &community).await?;
            println!("{}", report.message);
            println!(
                "saved={} errors={} (now: {}/{}, plan: {}/{})",
                report.saved,
                report.errors,
                report.breakdown.now.saved,
                report.breakdown.now.errors,
                report.breakdown.plan.saved,
                report.breakdown.plan.errors,
            );
            for detail in &report.error_details {
                eprintln!("  {}: {}", detail.plan, detail.error);
            }
        }
        Commands::Watch => {
            let service = build_service(&config).await?;
            let watchlist = load_watchlist(config.workspace_root.join("watchlist.yaml")).await?;
            let summary = hpt_ingest::run_watchlist(&service, &watchlist).await;
            println!(
                "watchlist run {}: pairs={} failed={} saved={} errors={}",
                summary.run_id,
                summary.pairs_attempted,
                summary.pairs_failed,
                summary.saved,
                summary.errors,
            );
        }
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url).await?;
            store.run_migrations().await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            let store = connect_store(&config).await?;
            let service = Arc::new(assemble_service(store.clone(), &config)?);
            if let Some(scheduler) = maybe_build_scheduler(service.clone(), &config).await? {
                scheduler.start().await.context("starting scheduler")?;
                tracing::info!(cron = %config.ingest_cron, "ingestion scheduler running");
            }
            let state = AppState::new(store, service, Arc::new(TokenGate::from_env()));
            hpt_web::serve_from_env(state).await?;
        }
    }

    Ok(())
}

async fn connect_store(config: &IngestConfig) -> Result<Arc<dyn CatalogStore>> {
    let store = PgStore::connect(&config.database_url)
        .await
        .context("connecting to database")?;
    Ok(Arc::new(store))
}

fn assemble_service(store: Arc<dyn CatalogStore>, config: &IngestConfig) -> Result<IngestService> {
    let provider = WebSearchClient::from_env().context("configuring search provider")?;
    Ok(IngestService::new(store, Arc::new(provider))
        .with_archive(ResponseArchive::new(&config.artifacts_dir))
        .with_task_timeout(Duration::from_secs(config.task_timeout_secs)))
}

async fn build_service(config: &IngestConfig) -> Result<IngestService> {
    let store = connect_store(config).await?;
    assemble_service(store, config)
}
