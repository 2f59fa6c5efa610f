use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::engine::SyncEngine;
use super::state::SyncState;
use super::{SyncError, SyncResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    /// Wait for the run and return its result.
    Blocking,
    /// Spawn the run and return immediately.
    Background,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TriggerOutcome {
    Completed(SyncResult),
    Started,
    AlreadyRunning,
}

impl TriggerOutcome {
    pub fn message(&self) -> &str {
        match self {
            TriggerOutcome::Completed(result) => &result.message,
            TriggerOutcome::Started => "sync started in background",
            TriggerOutcome::AlreadyRunning => "sync already in progress",
        }
    }
}

/// Owns the engine and the handle of any detached run.
#[derive(Clone)]
pub struct SyncSupervisor {
    engine: Arc<SyncEngine>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SyncSupervisor {
    pub fn new(engine: SyncEngine) -> Self {
        Self {
            engine: Arc::new(engine),
            task: Arc::new(Mutex::new(None)),
        }
    }

    /// Start a run. Overlapping triggers are never queued: a blocking one
    /// reports [`TriggerOutcome::AlreadyRunning`] and a background one no-ops
    /// with the same outcome.
    pub async fn trigger(&self, mode: TriggerMode) -> Result<TriggerOutcome, SyncError> {
        // Acquired before spawning so two triggers cannot both pass a check.
        let Some(guard) = self.engine.tracker().try_acquire() else {
            info!(?mode, "sync trigger ignored; a run is in progress");
            return Ok(TriggerOutcome::AlreadyRunning);
        };

        match mode {
            TriggerMode::Blocking => self.engine.run(guard).await.map(TriggerOutcome::Completed),
            TriggerMode::Background => {
                let engine = Arc::clone(&self.engine);
                let handle = tokio::spawn(async move {
                    if let Err(err) = engine.run(guard).await {
                        debug!(%err, "background sync ended with an error; status updated");
                    }
                });
                // Any earlier handle belongs to a run that already released the guard.
                self.task
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .replace(handle);
                info!("background sync started");
                Ok(TriggerOutcome::Started)
            }
        }
    }

    pub fn status(&self) -> SyncState {
        self.engine.tracker().snapshot()
    }

    /// Wait for the detached run, if any.
    pub async fn join_background(&self) {
        let handle = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return;
        };
        match handle.await {
            Ok(()) => {}
            Err(err) if err.is_panic() => error!("background sync task panicked"),
            Err(err) => error!(%err, "background sync task did not complete"),
        }
    }
}
