use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use inventory_sync::config::{self, Config};
use inventory_sync::db;
use inventory_sync::inventory::InventoryClient;
use inventory_sync::outbox::{self, DeliveryPolicy};
use inventory_sync::sync::{SyncEngine, SyncSupervisor, SyncTracker, TriggerMode, TriggerOutcome};

#[derive(Debug, Parser)]
#[command(author, version, about = "Inventory reconciliation and follow-up delivery daemon")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Run one background sync right after startup
    #[arg(long)]
    sync_on_start: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))
        .with_context(|| format!("loading {}", args.config.display()))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    // The worker gets its own client so a sync run closing its session
    // never invalidates a follow-up in flight.
    let poster = InventoryClient::from_config(&cfg)?;
    let worker_pool = pool.clone();
    let policy = DeliveryPolicy::from_config(&cfg);
    let poll_sleep = cfg.poll_interval();
    tokio::spawn(async move {
        if let Err(err) = outbox::run_worker(worker_pool, &poster, policy, poll_sleep).await {
            error!(?err, "outbox worker stopped");
        }
    });

    let source = Arc::new(InventoryClient::from_config(&cfg)?);
    let supervisor = SyncSupervisor::new(SyncEngine::new(pool, source, SyncTracker::new()));

    if args.sync_on_start {
        start_background_sync(&supervisor).await;
    }

    info!("inventory sync daemon started");
    tokio::select! {
        _ = schedule_syncs(&cfg, &supervisor) => {}
        res = tokio::signal::ctrl_c() => {
            if let Err(err) = res {
                error!(?err, "failed to listen for shutdown signal");
            }
        }
    }

    let status = supervisor.status();
    if status.running {
        warn!(
            assets = status.assets_synced,
            "shutting down during a sync; pages committed so far are kept"
        );
    }
    info!("inventory sync daemon stopped");
    Ok(())
}

/// Trigger a background sync every `sync_interval_seconds`; idles forever when unset.
async fn schedule_syncs(cfg: &Config, supervisor: &SyncSupervisor) {
    let Some(period) = cfg.sync_interval() else {
        std::future::pending::<()>().await;
        return;
    };
    info!(seconds = period.as_secs(), "scheduled sync enabled");
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        start_background_sync(supervisor).await;
    }
}

async fn start_background_sync(supervisor: &SyncSupervisor) {
    match supervisor.trigger(TriggerMode::Background).await {
        Ok(TriggerOutcome::AlreadyRunning) => {
            info!("previous sync still running; skipping this tick")
        }
        Ok(outcome) => info!(message = outcome.message(), "sync triggered"),
        Err(err) => error!(%err, "sync trigger failed"),
    }
}
