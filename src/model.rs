use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Sent,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Sent => "sent",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OutboxStatus::Pending),
            "sent" => Some(OutboxStatus::Sent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MaintenanceKind {
    Preventive,
    Corrective,
}

impl MaintenanceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MaintenanceKind::Preventive => "preventive",
            MaintenanceKind::Corrective => "corrective",
        }
    }

    pub fn parse_kind(s: &str) -> Option<Self> {
        match s {
            "preventive" => Some(MaintenanceKind::Preventive),
            "corrective" => Some(MaintenanceKind::Corrective),
            _ => None,
        }
    }
}

/// Locally reconciled asset, one row per external identifier.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LocalAsset {
    pub id: i64,
    pub external_id: i64,
    pub name: String,
    pub entity: String,
    pub asset_tag: String,
    pub serial: String,
    pub location: String,
    pub status: String,
    pub last_maintenance: Option<DateTime<Utc>>,
    pub next_maintenance: Option<DateTime<Utc>>,
    /// JSON text of the external record as last seen.
    pub raw_snapshot: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AssetComponent {
    pub id: i64,
    pub asset_id: i64,
    pub component_type: String,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub serial: String,
    pub capacity: String,
    pub raw_snapshot: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceRecord {
    pub id: i64,
    pub asset_id: i64,
    pub kind: MaintenanceKind,
    pub external_ticket_id: Option<i64>,
    pub description: String,
    pub performed_at: DateTime<Utc>,
    pub technician: Option<String>,
    pub next_due: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Pending or delivered follow-up for an external ticket. Never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: i64,
    pub maintenance_id: Option<i64>,
    pub ticket_id: i64,
    pub content: String,
    pub status: OutboxStatus,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

/// Input for recording a maintenance intervention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMaintenance {
    pub asset_id: i64,
    pub kind: MaintenanceKind,
    pub description: String,
    pub performed_at: DateTime<Utc>,
    pub technician: Option<String>,
    /// Days until the next preventive visit; ignored for corrective work.
    pub next_due_days: Option<i64>,
    /// Ticket in the inventory system that should receive a follow-up.
    pub external_ticket_id: Option<i64>,
}

/// Partial edit of a recorded intervention; `None` keeps the stored value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MaintenanceUpdate {
    pub kind: Option<MaintenanceKind>,
    pub description: Option<String>,
    pub performed_at: Option<DateTime<Utc>>,
    /// An empty name clears the technician.
    pub technician: Option<String>,
    /// New interval for preventive work; without it the old interval is kept.
    pub next_due_days: Option<i64>,
}
