use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use inventory_sync::config;
use inventory_sync::db;
use inventory_sync::inventory::InventoryClient;
use inventory_sync::sync::{SyncEngine, SyncTracker};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Run one full inventory reconciliation and print the result as JSON"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let source = Arc::new(InventoryClient::from_config(&cfg)?);
    let engine = SyncEngine::new(pool.clone(), source, SyncTracker::new());

    match engine.run_full_sync().await {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            info!(
                assets = db::count_assets(&pool).await?,
                components = db::count_components(&pool).await?,
                "local store totals"
            );
            Ok(())
        }
        Err(err) => {
            let committed = err.committed();
            error!(
                assets = committed.assets,
                components = committed.components,
                "sync aborted"
            );
            Err(err.into())
        }
    }
}
