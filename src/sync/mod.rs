//! Reconciliation of the local asset store against the external inventory.

use serde::Serialize;
use thiserror::Error;

use crate::inventory::ClientError;

pub mod engine;
pub mod state;
pub mod supervisor;

pub use engine::{SyncEngine, PAGE_SIZE};
pub use state::{RunGuard, SyncState, SyncTracker};
pub use supervisor::{SyncSupervisor, TriggerMode, TriggerOutcome};

/// Assets and components written by a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncCounts {
    pub assets: u64,
    pub components: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncResult {
    pub assets_synced: u64,
    pub components_synced: u64,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("a sync run is already in progress")]
    AlreadyRunning,
    /// The session could not be opened; nothing was processed.
    #[error("could not open inventory session: {0}")]
    Auth(#[source] ClientError),
    /// Pagination cannot continue past a page that failed to load.
    #[error("fetching assets at offset {offset} failed after {} assets were committed: {source}", .committed.assets)]
    PageFetch {
        offset: u32,
        committed: SyncCounts,
        #[source]
        source: ClientError,
    },
    #[error("local store failed after {} assets were committed: {source}", .committed.assets)]
    Store {
        committed: SyncCounts,
        #[source]
        source: sqlx::Error,
    },
}

impl SyncError {
    /// Work durably committed before the failure.
    pub fn committed(&self) -> SyncCounts {
        match self {
            SyncError::AlreadyRunning | SyncError::Auth(_) => SyncCounts::default(),
            SyncError::PageFetch { committed, .. } | SyncError::Store { committed, .. } => {
                *committed
            }
        }
    }
}
