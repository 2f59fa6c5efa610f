use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteConnection;
use sqlx::Connection;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use super::state::{RunGuard, SyncTracker};
use super::{SyncCounts, SyncError, SyncResult};
use crate::db::{self, AssetUpsert, ComponentInsert, Pool};
use crate::inventory::model::external_id;
use crate::inventory::{ComponentSets, InventorySource, RawRecord};

/// Records requested per catalog page.
pub const PAGE_SIZE: u32 = 50;

/// Pulls the external catalog page by page and upserts it into the store.
pub struct SyncEngine {
    pool: Pool,
    source: Arc<dyn InventorySource>,
    tracker: SyncTracker,
}

impl SyncEngine {
    pub fn new(pool: Pool, source: Arc<dyn InventorySource>, tracker: SyncTracker) -> Self {
        Self {
            pool,
            source,
            tracker,
        }
    }

    pub fn tracker(&self) -> &SyncTracker {
        &self.tracker
    }

    /// Run a full pass, refusing with [`SyncError::AlreadyRunning`] on overlap.
    pub async fn run_full_sync(&self) -> Result<SyncResult, SyncError> {
        let guard = self
            .tracker
            .try_acquire()
            .ok_or(SyncError::AlreadyRunning)?;
        self.run(guard).await
    }

    /// Run a full pass under an already acquired guard.
    #[instrument(skip_all)]
    pub async fn run(&self, guard: RunGuard) -> Result<SyncResult, SyncError> {
        info!("starting full inventory sync");
        let outcome = self.sync_catalog(&guard).await;
        self.source.close_session().await;

        match outcome {
            Ok(counts) => {
                let message = format!(
                    "Synced {} assets and {} components",
                    counts.assets, counts.components
                );
                info!(
                    assets = counts.assets,
                    components = counts.components,
                    "inventory sync finished"
                );
                guard.succeed(message.clone());
                Ok(SyncResult {
                    assets_synced: counts.assets,
                    components_synced: counts.components,
                    message,
                })
            }
            Err(err) => {
                error!(%err, "inventory sync failed");
                guard.fail(&err);
                Err(err)
            }
        }
    }

    async fn sync_catalog(&self, guard: &RunGuard) -> Result<SyncCounts, SyncError> {
        self.source.open_session().await.map_err(SyncError::Auth)?;

        let mut committed = SyncCounts::default();
        let mut offset = 0u32;
        loop {
            let page = self
                .source
                .fetch_assets_page(offset, PAGE_SIZE)
                .await
                .map_err(|source| SyncError::PageFetch {
                    offset,
                    committed,
                    source,
                })?;
            if page.is_empty() {
                break;
            }

            let page_counts = self
                .sync_page(&page, guard)
                .await
                .map_err(|source| SyncError::Store { committed, source })?;
            committed.assets += page_counts.assets;
            committed.components += page_counts.components;
            info!(
                offset,
                records = page.len(),
                assets = committed.assets,
                "catalog page committed"
            );

            // A short page is the last one; no need to ask for an empty one.
            if page.len() < PAGE_SIZE as usize {
                break;
            }
            offset += PAGE_SIZE;
        }
        Ok(committed)
    }

    /// Fetch the components of every record on the page, then upsert the
    /// page inside one transaction. No network call runs while it is open.
    async fn sync_page(&self, page: &[RawRecord], guard: &RunGuard) -> sqlx::Result<SyncCounts> {
        let mut fetched = Vec::with_capacity(page.len());
        for record in page {
            let Some(external_id) = external_id(record) else {
                debug!("skipping record without a usable id");
                continue;
            };
            guard.set_current(external_id);
            let sets = self.source.fetch_all_components(external_id).await;
            if !sets.failed.is_empty() {
                warn!(
                    external_id,
                    failed = ?sets.failed,
                    "components left unrefreshed for types that failed to load"
                );
            }
            fetched.push((AssetUpsert::from_record(external_id, record), sets));
        }

        let mut tx = self.pool.begin().await?;
        let mut counts = SyncCounts::default();
        for (asset, sets) in &fetched {
            let asset_id = upsert_asset(&mut tx, asset).await?;
            counts.assets += 1;
            guard.asset_synced();

            counts.components += replace_components(&mut tx, asset_id, sets, guard).await?;
            debug!(external_id = asset.external_id, "asset reconciled");
        }

        tx.commit().await?;
        Ok(counts)
    }
}

/// Swap the stored components of one asset for a fresh fetch.
///
/// Rows are replaced per component type that loaded; a type whose fetch
/// failed keeps whatever was stored before.
async fn replace_components(
    conn: &mut SqliteConnection,
    asset_id: i64,
    sets: &ComponentSets,
    guard: &RunGuard,
) -> sqlx::Result<u64> {
    let types: Vec<_> = sets.fetched.keys().copied().collect();
    let removed = db::delete_components(conn, asset_id, &types).await?;

    let now = Utc::now();
    let mut inserted = 0;
    for (component_type, items) in &sets.fetched {
        for item in items {
            let component = ComponentInsert::from_record(*component_type, item);
            db::insert_component(conn, asset_id, &component, now).await?;
            inserted += 1;
            guard.component_synced();
        }
    }
    debug!(asset_id, removed, inserted, "components replaced");
    Ok(inserted)
}

/// Find-or-create by external id, then overwrite the mutable attributes.
pub(crate) async fn upsert_asset(
    conn: &mut SqliteConnection,
    asset: &AssetUpsert,
) -> sqlx::Result<i64> {
    let now = Utc::now();
    if let Some(id) = db::find_asset_id(&mut *conn, asset.external_id).await? {
        db::update_asset(conn, id, asset, now).await?;
        return Ok(id);
    }
    create_or_adopt_asset(conn, asset, now).await
}

/// Insert a new asset; if another writer inserted the same external id first,
/// undo only the failed insert and update the winning row instead.
async fn create_or_adopt_asset(
    conn: &mut SqliteConnection,
    asset: &AssetUpsert,
    now: DateTime<Utc>,
) -> sqlx::Result<i64> {
    let mut savepoint = conn.begin().await?;
    match db::insert_asset(&mut savepoint, asset, now).await {
        Ok(id) => {
            savepoint.commit().await?;
            Ok(id)
        }
        Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
            savepoint.rollback().await?;
            warn!(
                external_id = asset.external_id,
                "asset created concurrently; adopting the existing row"
            );
            let id = db::find_asset_id(&mut *conn, asset.external_id)
                .await?
                .ok_or(sqlx::Error::RowNotFound)?;
            db::update_asset(conn, id, asset, now).await?;
            Ok(id)
        }
        Err(err) => Err(err),
    }
}
