//! Maintenance write path. Each recorded intervention refreshes the asset's
//! maintenance dates and, when tied to an external ticket, queues a follow-up
//! in the same transaction so the notification intent is never lost.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use thiserror::Error;
use tracing::{info, instrument};

use crate::db::{self, Pool};
use crate::model::{
    MaintenanceKind, MaintenanceRecord, MaintenanceUpdate, NewMaintenance, OutboxEntry,
};
use crate::outbox;

#[derive(Debug, Error)]
pub enum MaintenanceError {
    #[error("asset {0} not found")]
    AssetNotFound(i64),
    #[error("maintenance record {0} not found")]
    RecordNotFound(i64),
    #[error(transparent)]
    Store(#[from] sqlx::Error),
}

/// Next visit for preventive work; corrective work schedules nothing.
pub fn next_due(
    kind: MaintenanceKind,
    performed_at: DateTime<Utc>,
    next_due_days: Option<i64>,
) -> Option<DateTime<Utc>> {
    match (kind, next_due_days) {
        (MaintenanceKind::Preventive, Some(days)) if days > 0 => {
            Some(performed_at + ChronoDuration::days(days))
        }
        _ => None,
    }
}

/// Text posted to the external ticket for a recorded intervention.
pub fn followup_content(record: &MaintenanceRecord) -> String {
    let kind = match record.kind {
        MaintenanceKind::Preventive => "Preventive",
        MaintenanceKind::Corrective => "Corrective",
    };
    let mut content = format!(
        "{} maintenance performed on {}",
        kind,
        record.performed_at.format("%Y-%m-%d %H:%M UTC")
    );
    if let Some(technician) = record.technician.as_deref().filter(|t| !t.is_empty()) {
        content.push_str(&format!(" by {}", technician));
    }
    content.push_str(&format!(": {}", record.description));
    if let Some(next) = record.next_due {
        content.push_str(&format!("\nNext maintenance due {}.", next.format("%Y-%m-%d")));
    }
    content
}

#[instrument(skip_all, fields(asset_id = new.asset_id))]
pub async fn record_maintenance(
    pool: &Pool,
    new: NewMaintenance,
) -> Result<(MaintenanceRecord, Option<OutboxEntry>), MaintenanceError> {
    let mut tx = pool.begin().await?;
    if db::get_asset(&mut *tx, new.asset_id).await?.is_none() {
        return Err(MaintenanceError::AssetNotFound(new.asset_id));
    }

    let now = Utc::now();
    let due = next_due(new.kind, new.performed_at, new.next_due_days);
    let record = db::insert_maintenance(&mut tx, &new, due, now).await?;
    db::set_asset_maintenance(&mut tx, new.asset_id, Some(record.performed_at), due, now).await?;

    let followup = match record.external_ticket_id {
        Some(ticket_id) => {
            let content = followup_content(&record);
            Some(outbox::enqueue_in(&mut tx, ticket_id, &content, Some(record.id)).await?)
        }
        None => None,
    };
    tx.commit().await?;

    info!(
        id = record.id,
        kind = record.kind.as_str(),
        followup = followup.as_ref().map(|e| e.id),
        "maintenance recorded"
    );
    Ok((record, followup))
}

/// Edit a stored record. The next due date follows the edited kind and date:
/// corrective work clears it, preventive work keeps its interval unless a new
/// one is given. The asset's dates are then refreshed from its latest record.
/// Follow-ups already queued are not rewritten.
#[instrument(skip_all, fields(id = id))]
pub async fn update_maintenance(
    pool: &Pool,
    id: i64,
    update: MaintenanceUpdate,
) -> Result<MaintenanceRecord, MaintenanceError> {
    let mut tx = pool.begin().await?;
    let stored = db::get_maintenance(&mut tx, id)
        .await?
        .ok_or(MaintenanceError::RecordNotFound(id))?;

    let mut edited = stored.clone();
    if let Some(kind) = update.kind {
        edited.kind = kind;
    }
    if let Some(description) = update.description {
        edited.description = description;
    }
    if let Some(performed_at) = update.performed_at {
        edited.performed_at = performed_at;
    }
    if let Some(technician) = update.technician {
        edited.technician = Some(technician).filter(|t| !t.is_empty());
    }
    edited.next_due = match (edited.kind, update.next_due_days) {
        (MaintenanceKind::Corrective, _) => None,
        (MaintenanceKind::Preventive, Some(days)) => {
            next_due(edited.kind, edited.performed_at, Some(days))
        }
        (MaintenanceKind::Preventive, None) => stored
            .next_due
            .map(|due| edited.performed_at + (due - stored.performed_at)),
    };

    let now = Utc::now();
    let record = db::update_maintenance_row(&mut tx, &edited, now).await?;
    let (last, next) = match db::latest_maintenance(&mut tx, record.asset_id).await? {
        Some(latest) => (Some(latest.performed_at), latest.next_due),
        None => (None, None),
    };
    db::set_asset_maintenance(&mut tx, record.asset_id, last, next, now).await?;
    tx.commit().await?;

    info!(asset_id = record.asset_id, kind = record.kind.as_str(), "maintenance record updated");
    Ok(record)
}

/// Delete a record and roll the asset's dates back to the latest remaining one.
/// Returns the owning asset id. Queued follow-ups stay as audit rows.
#[instrument(skip_all, fields(id = id))]
pub async fn delete_maintenance(pool: &Pool, id: i64) -> Result<i64, MaintenanceError> {
    let mut tx = pool.begin().await?;
    let record = db::get_maintenance(&mut tx, id)
        .await?
        .ok_or(MaintenanceError::RecordNotFound(id))?;
    db::delete_maintenance_row(&mut tx, id).await?;

    let (last, next) = match db::latest_maintenance(&mut tx, record.asset_id).await? {
        Some(latest) => (Some(latest.performed_at), latest.next_due),
        None => (None, None),
    };
    db::set_asset_maintenance(&mut tx, record.asset_id, last, next, Utc::now()).await?;
    tx.commit().await?;

    info!(asset_id = record.asset_id, "maintenance record deleted");
    Ok(record.asset_id)
}

/// Records of one asset, most recent first.
pub async fn maintenance_history(
    pool: &Pool,
    asset_id: i64,
) -> Result<Vec<MaintenanceRecord>, MaintenanceError> {
    if db::get_asset(pool, asset_id).await?.is_none() {
        return Err(MaintenanceError::AssetNotFound(asset_id));
    }
    Ok(db::list_maintenance(pool, asset_id).await?)
}
