use super::model::{AssetUpsert, ComponentInsert};
use crate::inventory::ComponentType;
use crate::model::{
    AssetComponent, LocalAsset, MaintenanceKind, MaintenanceRecord, NewMaintenance, OutboxEntry,
    OutboxStatus,
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{Executor, Row, Sqlite, SqlitePool};
use std::str::FromStr;
use std::time::Duration;
use tracing::instrument;

pub type Pool = SqlitePool;

const OUTBOX_COLUMNS: &str =
    "id, maintenance_id, ticket_id, content, status, attempts, last_error, created_at, sent_at";

const MAINTENANCE_COLUMNS: &str = "id, asset_id, kind, external_ticket_id, description, \
     performed_at, technician, next_due, created_at, updated_at";

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let in_memory = normalized.starts_with("sqlite::memory");
    let options = SqliteConnectOptions::from_str(&normalized)
        .with_context(|| format!("invalid database URL {}", normalized))?
        .create_if_missing(true)
        // WAL plus full sync: readers never block the writer and commits are durable.
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(30));

    let mut pool_options = SqlitePoolOptions::new();
    if in_memory {
        // Every in-memory connection is its own database; keep exactly one alive.
        pool_options = pool_options
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None);
    }
    let pool = pool_options.connect_with(options).await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            // A missing directory surfaces as a connect error right after.
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Assets and components

pub async fn find_asset_id<'e, E>(executor: E, external_id: i64) -> sqlx::Result<Option<i64>>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_scalar("SELECT id FROM assets WHERE external_id = ?")
        .bind(external_id)
        .fetch_optional(executor)
        .await
}

/// Plain insert; a duplicate `external_id` surfaces as a unique violation.
pub async fn insert_asset(
    conn: &mut SqliteConnection,
    asset: &AssetUpsert,
    now: DateTime<Utc>,
) -> sqlx::Result<i64> {
    sqlx::query_scalar(
        "INSERT INTO assets (external_id, name, entity, asset_tag, serial, location, status, raw_snapshot, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(asset.external_id)
    .bind(&asset.name)
    .bind(&asset.entity)
    .bind(&asset.asset_tag)
    .bind(&asset.serial)
    .bind(&asset.location)
    .bind(&asset.status)
    .bind(&asset.raw_snapshot)
    .bind(now)
    .bind(now)
    .fetch_one(&mut *conn)
    .await
}

/// Overwrite every mutable attribute. `external_id` is never rewritten.
pub async fn update_asset(
    conn: &mut SqliteConnection,
    id: i64,
    asset: &AssetUpsert,
    now: DateTime<Utc>,
) -> sqlx::Result<()> {
    sqlx::query(
        "UPDATE assets SET name = ?, entity = ?, asset_tag = ?, serial = ?, location = ?, status = ?, raw_snapshot = ?, updated_at = ? WHERE id = ?",
    )
    .bind(&asset.name)
    .bind(&asset.entity)
    .bind(&asset.asset_tag)
    .bind(&asset.serial)
    .bind(&asset.location)
    .bind(&asset.status)
    .bind(&asset.raw_snapshot)
    .bind(now)
    .bind(id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn delete_components(
    conn: &mut SqliteConnection,
    asset_id: i64,
    types: &[ComponentType],
) -> sqlx::Result<u64> {
    let mut removed = 0;
    for component_type in types {
        removed += sqlx::query("DELETE FROM asset_components WHERE asset_id = ? AND component_type = ?")
            .bind(asset_id)
            .bind(component_type.as_str())
            .execute(&mut *conn)
            .await?
            .rows_affected();
    }
    Ok(removed)
}

pub async fn insert_component(
    conn: &mut SqliteConnection,
    asset_id: i64,
    component: &ComponentInsert,
    now: DateTime<Utc>,
) -> sqlx::Result<i64> {
    sqlx::query_scalar(
        "INSERT INTO asset_components (asset_id, component_type, name, manufacturer, model, serial, capacity, raw_snapshot, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(asset_id)
    .bind(component.component_type.as_str())
    .bind(&component.name)
    .bind(&component.manufacturer)
    .bind(&component.model)
    .bind(&component.serial)
    .bind(&component.capacity)
    .bind(&component.raw_snapshot)
    .bind(now)
    .fetch_one(&mut *conn)
    .await
}

pub async fn get_asset<'e, E>(executor: E, id: i64) -> sqlx::Result<Option<LocalAsset>>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, LocalAsset>("SELECT * FROM assets WHERE id = ?")
        .bind(id)
        .fetch_optional(executor)
        .await
}

pub async fn get_asset_by_external_id<'e, E>(
    executor: E,
    external_id: i64,
) -> sqlx::Result<Option<LocalAsset>>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, LocalAsset>("SELECT * FROM assets WHERE external_id = ?")
        .bind(external_id)
        .fetch_optional(executor)
        .await
}

pub async fn list_components(pool: &Pool, asset_id: i64) -> sqlx::Result<Vec<AssetComponent>> {
    sqlx::query_as::<_, AssetComponent>(
        "SELECT * FROM asset_components WHERE asset_id = ? ORDER BY component_type, id",
    )
    .bind(asset_id)
    .fetch_all(pool)
    .await
}

pub async fn count_assets(pool: &Pool) -> sqlx::Result<i64> {
    sqlx::query_scalar("SELECT COUNT(*) FROM assets")
        .fetch_one(pool)
        .await
}

pub async fn count_components(pool: &Pool) -> sqlx::Result<i64> {
    sqlx::query_scalar("SELECT COUNT(*) FROM asset_components")
        .fetch_one(pool)
        .await
}

// ---------------------------------------------------------------------------
// Maintenance records

fn maintenance_from_row(row: &SqliteRow) -> sqlx::Result<MaintenanceRecord> {
    let kind: String = row.try_get("kind")?;
    let kind = MaintenanceKind::parse_kind(&kind)
        .ok_or_else(|| sqlx::Error::Decode(format!("unknown maintenance kind {:?}", kind).into()))?;
    Ok(MaintenanceRecord {
        id: row.try_get("id")?,
        asset_id: row.try_get("asset_id")?,
        kind,
        external_ticket_id: row.try_get("external_ticket_id")?,
        description: row.try_get("description")?,
        performed_at: row.try_get("performed_at")?,
        technician: row.try_get("technician")?,
        next_due: row.try_get("next_due")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[instrument(skip_all)]
pub async fn insert_maintenance(
    conn: &mut SqliteConnection,
    new: &NewMaintenance,
    next_due: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> sqlx::Result<MaintenanceRecord> {
    let sql = format!(
        "INSERT INTO maintenance_records (asset_id, kind, external_ticket_id, description, performed_at, technician, next_due, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING {}",
        MAINTENANCE_COLUMNS
    );
    let row = sqlx::query(&sql)
        .bind(new.asset_id)
        .bind(new.kind.as_str())
        .bind(new.external_ticket_id)
        .bind(&new.description)
        .bind(new.performed_at)
        .bind(new.technician.as_deref())
        .bind(next_due)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *conn)
        .await?;
    maintenance_from_row(&row)
}

/// Overwrite the editable fields of a stored record.
pub async fn update_maintenance_row(
    conn: &mut SqliteConnection,
    record: &MaintenanceRecord,
    now: DateTime<Utc>,
) -> sqlx::Result<MaintenanceRecord> {
    let sql = format!(
        "UPDATE maintenance_records SET kind = ?, description = ?, performed_at = ?, technician = ?, next_due = ?, updated_at = ? \
         WHERE id = ? RETURNING {}",
        MAINTENANCE_COLUMNS
    );
    let row = sqlx::query(&sql)
        .bind(record.kind.as_str())
        .bind(&record.description)
        .bind(record.performed_at)
        .bind(record.technician.as_deref())
        .bind(record.next_due)
        .bind(now)
        .bind(record.id)
        .fetch_one(&mut *conn)
        .await?;
    maintenance_from_row(&row)
}

pub async fn get_maintenance(
    conn: &mut SqliteConnection,
    id: i64,
) -> sqlx::Result<Option<MaintenanceRecord>> {
    let sql = format!("SELECT {} FROM maintenance_records WHERE id = ?", MAINTENANCE_COLUMNS);
    sqlx::query(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .map(|row| maintenance_from_row(&row))
        .transpose()
}

pub async fn latest_maintenance(
    conn: &mut SqliteConnection,
    asset_id: i64,
) -> sqlx::Result<Option<MaintenanceRecord>> {
    let sql = format!(
        "SELECT {} FROM maintenance_records WHERE asset_id = ? ORDER BY performed_at DESC, id DESC LIMIT 1",
        MAINTENANCE_COLUMNS
    );
    sqlx::query(&sql)
        .bind(asset_id)
        .fetch_optional(&mut *conn)
        .await?
        .map(|row| maintenance_from_row(&row))
        .transpose()
}

pub async fn list_maintenance(pool: &Pool, asset_id: i64) -> sqlx::Result<Vec<MaintenanceRecord>> {
    let sql = format!(
        "SELECT {} FROM maintenance_records WHERE asset_id = ? ORDER BY performed_at DESC, id DESC",
        MAINTENANCE_COLUMNS
    );
    sqlx::query(&sql)
        .bind(asset_id)
        .fetch_all(pool)
        .await?
        .iter()
        .map(maintenance_from_row)
        .collect()
}

pub async fn delete_maintenance_row(conn: &mut SqliteConnection, id: i64) -> sqlx::Result<bool> {
    let res = sqlx::query("DELETE FROM maintenance_records WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(res.rows_affected() > 0)
}

pub async fn set_asset_maintenance(
    conn: &mut SqliteConnection,
    asset_id: i64,
    last: Option<DateTime<Utc>>,
    next: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> sqlx::Result<()> {
    sqlx::query(
        "UPDATE assets SET last_maintenance = ?, next_maintenance = ?, updated_at = ? WHERE id = ?",
    )
    .bind(last)
    .bind(next)
    .bind(now)
    .bind(asset_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Follow-up outbox

fn outbox_from_row(row: &SqliteRow) -> sqlx::Result<OutboxEntry> {
    let status: String = row.try_get("status")?;
    let status = OutboxStatus::parse_status(&status)
        .ok_or_else(|| sqlx::Error::Decode(format!("unknown outbox status {:?}", status).into()))?;
    Ok(OutboxEntry {
        id: row.try_get("id")?,
        maintenance_id: row.try_get("maintenance_id")?,
        ticket_id: row.try_get("ticket_id")?,
        content: row.try_get("content")?,
        status,
        attempts: row.try_get("attempts")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        sent_at: row.try_get("sent_at")?,
    })
}

#[instrument(skip_all)]
pub async fn insert_outbox(
    conn: &mut SqliteConnection,
    ticket_id: i64,
    content: &str,
    maintenance_id: Option<i64>,
    now: DateTime<Utc>,
) -> sqlx::Result<OutboxEntry> {
    let sql = format!(
        "INSERT INTO followup_outbox (maintenance_id, ticket_id, content, status, attempts, created_at) \
         VALUES (?, ?, ?, ?, 0, ?) RETURNING {}",
        OUTBOX_COLUMNS
    );
    let row = sqlx::query(&sql)
        .bind(maintenance_id)
        .bind(ticket_id)
        .bind(content)
        .bind(OutboxStatus::Pending.as_str())
        .bind(now)
        .fetch_one(&mut *conn)
        .await?;
    outbox_from_row(&row)
}

/// Atomically lease up to `limit` pending entries, oldest first.
///
/// The select and the lease stamp run as one UPDATE statement, so concurrent
/// callers never receive the same row while its lease is live.
#[instrument(skip_all)]
pub async fn claim_pending_outbox(
    pool: &Pool,
    claim_token: &str,
    limit: i64,
    now: DateTime<Utc>,
    lease_until: DateTime<Utc>,
) -> sqlx::Result<Vec<OutboxEntry>> {
    let sql = format!(
        "UPDATE followup_outbox SET claim_token = ?, claimed_until = ? \
         WHERE id IN ( \
             SELECT id FROM followup_outbox \
             WHERE status = ? AND (claimed_until IS NULL OR claimed_until <= ?) \
             ORDER BY created_at ASC, id ASC LIMIT ? \
         ) RETURNING {}",
        OUTBOX_COLUMNS
    );
    let rows = sqlx::query(&sql)
        .bind(claim_token)
        .bind(lease_until)
        .bind(OutboxStatus::Pending.as_str())
        .bind(now)
        .bind(limit)
        .fetch_all(pool)
        .await?;
    let mut entries = rows
        .iter()
        .map(outbox_from_row)
        .collect::<sqlx::Result<Vec<_>>>()?;
    // RETURNING order is unspecified.
    entries.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
    Ok(entries)
}

/// Bump the attempt counter of a claimed entry. `None` if the claim was lost.
pub async fn record_outbox_attempt(
    pool: &Pool,
    id: i64,
    claim_token: &str,
) -> sqlx::Result<Option<i64>> {
    sqlx::query_scalar(
        "UPDATE followup_outbox SET attempts = attempts + 1 \
         WHERE id = ? AND claim_token = ? AND status = 'pending' RETURNING attempts",
    )
    .bind(id)
    .bind(claim_token)
    .fetch_optional(pool)
    .await
}

pub async fn mark_outbox_sent(
    pool: &Pool,
    id: i64,
    claim_token: &str,
    sent_at: DateTime<Utc>,
) -> sqlx::Result<bool> {
    let res = sqlx::query(
        "UPDATE followup_outbox SET status = 'sent', sent_at = ?, last_error = NULL, claim_token = NULL, claimed_until = NULL \
         WHERE id = ? AND claim_token = ?",
    )
    .bind(sent_at)
    .bind(id)
    .bind(claim_token)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() > 0)
}

/// Record a failed delivery and drop the claim. The entry stays pending but
/// cannot be claimed again before `retry_at`.
pub async fn record_outbox_failure(
    pool: &Pool,
    id: i64,
    claim_token: &str,
    error: &str,
    retry_at: DateTime<Utc>,
) -> sqlx::Result<bool> {
    let res = sqlx::query(
        "UPDATE followup_outbox SET last_error = ?, claim_token = NULL, claimed_until = ? \
         WHERE id = ? AND claim_token = ?",
    )
    .bind(error)
    .bind(retry_at)
    .bind(id)
    .bind(claim_token)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() > 0)
}

pub async fn get_outbox(pool: &Pool, id: i64) -> sqlx::Result<Option<OutboxEntry>> {
    let sql = format!("SELECT {} FROM followup_outbox WHERE id = ?", OUTBOX_COLUMNS);
    sqlx::query(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?
        .map(|row| outbox_from_row(&row))
        .transpose()
}

pub async fn count_outbox(pool: &Pool, status: OutboxStatus) -> sqlx::Result<i64> {
    sqlx::query_scalar("SELECT COUNT(*) FROM followup_outbox WHERE status = ?")
        .bind(status.as_str())
        .fetch_one(pool)
        .await
}
