use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use inventory_sync::config;
use inventory_sync::db;
use inventory_sync::inventory::InventoryClient;
use inventory_sync::model::OutboxStatus;
use inventory_sync::outbox::{self, DeliveryPolicy, OutboxStats};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Deliver pending ticket follow-ups and exit when a pass sends nothing new"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Process a single batch and exit
    #[arg(long)]
    once: bool,

    /// Override `app.outbox_batch_size`
    #[arg(long)]
    batch_size: Option<i64>,
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

    let client = InventoryClient::from_config(&cfg)?;
    let mut policy = DeliveryPolicy::from_config(&cfg);
    if let Some(batch_size) = args.batch_size {
        policy.batch_size = batch_size;
    }
    let pending = db::count_outbox(&pool, OutboxStatus::Pending).await?;
    info!(pending, batch_size = policy.batch_size, "processing follow-up outbox");

    let mut total = OutboxStats::default();
    loop {
        let stats = outbox::process_pending(&pool, &client, &policy).await?;
        total.processed += stats.processed;
        total.sent += stats.sent;
        total.failed += stats.failed;
        // Failed entries are parked behind their backoff; stop once a pass
        // delivers nothing and leave them for a later run.
        if args.once || stats.sent == 0 {
            break;
        }
    }

    let remaining = db::count_outbox(&pool, OutboxStatus::Pending).await?;
    info!(remaining, "outbox pass finished");
    println!("{}", serde_json::to_string_pretty(&total)?);
    Ok(())
}
