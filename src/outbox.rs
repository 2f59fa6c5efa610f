//! Durable queue of ticket follow-ups and its delivery processor.
//!
//! Entries move `pending -> sent` and are never deleted. A processor first
//! leases a batch under a fresh claim token; every later write is conditioned
//! on that token, so two processors never deliver the same entry while a lease
//! is live. A crashed processor's lease expires and the entry is retried,
//! which makes delivery at-least-once. A rejected delivery is parked behind a
//! capped exponential backoff before it can be claimed again.

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteConnection;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::db::{self, Pool};
use crate::inventory::{FollowupOutcome, FollowupPoster};
use crate::model::OutboxEntry;

pub const DEFAULT_BATCH_SIZE: i64 = 25;
pub const MAX_BATCH_SIZE: i64 = 200;
pub const DEFAULT_MAX_BACKOFF_SECONDS: u64 = 3600;

/// Delay before the first retry; doubles with every further failure.
const BASE_BACKOFF_SECS: u64 = 5;

/// How a processor claims and retries entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryPolicy {
    pub batch_size: i64,
    pub lease: Duration,
    /// Upper bound for the retry delay; zero retries on the next pass.
    pub max_backoff: Duration,
}

impl DeliveryPolicy {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            batch_size: cfg.app.outbox_batch_size,
            lease: cfg.outbox_lease(),
            max_backoff: cfg.outbox_max_backoff(),
        }
    }

    /// `5s * 2^(attempts - 1)`, capped at `max_backoff`.
    pub fn backoff(&self, attempts: i64) -> Duration {
        let exponent = attempts.saturating_sub(1).clamp(0, 10) as u32;
        Duration::from_secs(BASE_BACKOFF_SECS << exponent).min(self.max_backoff)
    }
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            lease: Duration::from_secs(120),
            max_backoff: Duration::from_secs(DEFAULT_MAX_BACKOFF_SECONDS),
        }
    }
}

fn to_chrono(duration: Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or(ChronoDuration::seconds(i64::from(u32::MAX)))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutboxStats {
    pub processed: u64,
    pub sent: u64,
    pub failed: u64,
}

/// Persist a new pending follow-up.
pub async fn enqueue(
    pool: &Pool,
    ticket_id: i64,
    content: &str,
    origin: Option<i64>,
) -> sqlx::Result<OutboxEntry> {
    let mut conn = pool.acquire().await?;
    enqueue_in(&mut conn, ticket_id, content, origin).await
}

/// Same as [`enqueue`] on a caller-owned connection or transaction.
pub async fn enqueue_in(
    conn: &mut SqliteConnection,
    ticket_id: i64,
    content: &str,
    origin: Option<i64>,
) -> sqlx::Result<OutboxEntry> {
    let entry = db::insert_outbox(conn, ticket_id, content, origin, Utc::now()).await?;
    debug!(id = entry.id, ticket_id, "follow-up enqueued");
    Ok(entry)
}

/// Lease and deliver one batch of pending entries, oldest first.
#[instrument(skip_all)]
pub async fn process_pending(
    pool: &Pool,
    poster: &dyn FollowupPoster,
    policy: &DeliveryPolicy,
) -> sqlx::Result<OutboxStats> {
    let limit = policy.batch_size.clamp(1, MAX_BATCH_SIZE);
    let claim = Uuid::new_v4().to_string();
    let now = Utc::now();
    let lease_until = now + to_chrono(policy.lease);

    let batch = db::claim_pending_outbox(pool, &claim, limit, now, lease_until).await?;
    let mut stats = OutboxStats::default();

    for entry in batch {
        // Persisted before the call so a crash mid-send still counts the attempt.
        let Some(attempt) = db::record_outbox_attempt(pool, entry.id, &claim).await? else {
            warn!(id = entry.id, "outbox claim lost before delivery; skipping");
            continue;
        };
        stats.processed += 1;

        match poster.post_followup(entry.ticket_id, &entry.content).await {
            FollowupOutcome::Delivered { shape } => {
                if db::mark_outbox_sent(pool, entry.id, &claim, Utc::now()).await? {
                    info!(id = entry.id, ticket_id = entry.ticket_id, attempt, %shape, "follow-up delivered");
                } else {
                    warn!(id = entry.id, "follow-up delivered after the lease was lost");
                }
                stats.sent += 1;
            }
            outcome @ FollowupOutcome::Rejected { .. } => {
                let message = outcome
                    .error_summary()
                    .unwrap_or_else(|| "follow-up rejected".to_string());
                let delay = policy.backoff(attempt);
                warn!(
                    id = entry.id,
                    ticket_id = entry.ticket_id,
                    attempt,
                    retry_in_secs = delay.as_secs(),
                    error = %message,
                    "follow-up delivery failed; backing off"
                );
                let retry_at = Utc::now() + to_chrono(delay);
                db::record_outbox_failure(pool, entry.id, &claim, &message, retry_at).await?;
                stats.failed += 1;
            }
        }
    }

    if stats.processed > 0 {
        info!(
            processed = stats.processed,
            sent = stats.sent,
            failed = stats.failed,
            "outbox batch done"
        );
    }
    Ok(stats)
}

/// Drain the outbox forever, sleeping `poll_interval` whenever nothing is due.
pub async fn run_worker(
    pool: Pool,
    poster: &dyn FollowupPoster,
    policy: DeliveryPolicy,
    poll_interval: Duration,
) -> Result<()> {
    loop {
        match process_pending(&pool, poster, &policy).await {
            Ok(stats) => {
                if stats.processed == 0 {
                    tokio::time::sleep(poll_interval).await;
                }
            }
            Err(err) => {
                error!(?err, "outbox worker error");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
