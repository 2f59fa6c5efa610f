//! Process-wide status register with a single-flight guard.
//!
//! [`SyncTracker::try_acquire`] hands out at most one [`RunGuard`] at a time.
//! The guard is the only writer; dropping it (normal return, early error or
//! unwinding panic) finalizes the register, so a crashed run can never leave
//! the tracker stuck in the running state.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Display;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Snapshot of the current or last reconciliation run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncState {
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub assets_synced: u64,
    pub components_synced: u64,
    pub current_external_id: Option<i64>,
    pub message: Option<String>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SyncTracker {
    inner: Arc<Mutex<SyncState>>,
}

impl SyncTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SyncState> {
        // The state stays consistent field by field, so a poisoned lock is usable.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a run unless one is active. Never blocks.
    pub fn try_acquire(&self) -> Option<RunGuard> {
        let mut state = self.lock();
        if state.running {
            return None;
        }
        *state = SyncState {
            running: true,
            started_at: Some(Utc::now()),
            message: Some("sync in progress".to_string()),
            ..SyncState::default()
        };
        Some(RunGuard {
            tracker: self.clone(),
            finished: false,
        })
    }

    pub fn snapshot(&self) -> SyncState {
        self.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }
}

/// Exclusive handle on the register for the lifetime of one run.
#[derive(Debug)]
pub struct RunGuard {
    tracker: SyncTracker,
    finished: bool,
}

impl RunGuard {
    pub fn set_current(&self, external_id: i64) {
        self.tracker.lock().current_external_id = Some(external_id);
    }

    pub fn asset_synced(&self) {
        self.tracker.lock().assets_synced += 1;
    }

    pub fn component_synced(&self) {
        self.tracker.lock().components_synced += 1;
    }

    pub fn succeed(mut self, message: impl Into<String>) {
        let mut state = self.tracker.lock();
        state.message = Some(message.into());
        finish(&mut state);
        self.finished = true;
    }

    pub fn fail(mut self, error: &dyn Display) {
        let mut state = self.tracker.lock();
        state.message = Some("sync failed".to_string());
        state.last_error = Some(error.to_string());
        finish(&mut state);
        self.finished = true;
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let mut state = self.tracker.lock();
        if state.last_error.is_none() {
            state.last_error = Some("sync run ended unexpectedly".to_string());
        }
        state.message = Some("sync aborted".to_string());
        finish(&mut state);
    }
}

fn finish(state: &mut SyncState) {
    state.running = false;
    state.finished_at = Some(Utc::now());
    state.current_external_id = None;
}
