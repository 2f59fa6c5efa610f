use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};

use inventory_sync::db::{self, Pool};
use inventory_sync::inventory::{ClientError, ComponentType, InventorySource, RawRecord};
use inventory_sync::model::OutboxStatus;
use inventory_sync::outbox;
use inventory_sync::sync::{
    SyncEngine, SyncError, SyncSupervisor, SyncTracker, TriggerMode, TriggerOutcome, PAGE_SIZE,
};

async fn setup_pool() -> Pool {
    let pool = db::init_pool("sqlite::memory:").await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    pool
}

fn record(value: Value) -> RawRecord {
    value.as_object().cloned().unwrap()
}

fn computer(id: i64) -> RawRecord {
    record(json!({
        "id": id,
        "name": format!("pc-{}", id),
        "serial": format!("SN{:04}", id),
        "otherserial": format!("TAG-{}", id),
        "entities_id": "Root entity",
        "locations_id": {"id": 3, "completename": "Building A > Room 1"},
        "states_id": "42",
    }))
}

fn part(name: &str) -> RawRecord {
    record(json!({"designation": name, "manufacturers_id": "Acme", "serial": "X1"}))
}

/// Scripted catalog that records every call made against it.
#[derive(Clone, Default)]
struct FakeInventory {
    catalog: Arc<Mutex<Vec<RawRecord>>>,
    components: Arc<Mutex<HashMap<(i64, ComponentType), Result<Vec<RawRecord>, String>>>>,
    page_calls: Arc<Mutex<Vec<(u32, u32)>>>,
    fail_page_at: Arc<Mutex<Option<u32>>>,
    reject_auth: bool,
    opened: Arc<Mutex<u32>>,
    closed: Arc<Mutex<u32>>,
    gate: Option<Arc<Semaphore>>,
    /// Another writer on the same store, used while processors are fetched.
    writer: Option<Pool>,
    writes: Arc<Mutex<Vec<bool>>>,
}

impl FakeInventory {
    fn with_catalog(count: i64) -> Self {
        Self {
            catalog: Arc::new(Mutex::new((1..=count).map(computer).collect())),
            ..Default::default()
        }
    }

    async fn set_components(&self, asset: i64, kind: ComponentType, items: Vec<RawRecord>) {
        self.components
            .lock()
            .await
            .insert((asset, kind), Ok(items));
    }

    async fn fail_components(&self, asset: i64, kind: ComponentType) {
        self.components
            .lock()
            .await
            .insert((asset, kind), Err("503 Service Unavailable".into()));
    }

    async fn page_calls(&self) -> Vec<(u32, u32)> {
        self.page_calls.lock().await.clone()
    }
}

#[async_trait]
impl InventorySource for FakeInventory {
    async fn open_session(&self) -> Result<(), ClientError> {
        *self.opened.lock().await += 1;
        if self.reject_auth {
            return Err(ClientError::Auth("401: ERROR_LOGIN_PARAMETERS_MISSING".into()));
        }
        Ok(())
    }

    async fn close_session(&self) {
        *self.closed.lock().await += 1;
    }

    async fn fetch_assets_page(
        &self,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<RawRecord>, ClientError> {
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        self.page_calls.lock().await.push((offset, limit));
        if *self.fail_page_at.lock().await == Some(offset) {
            return Err(ClientError::Decode("connection reset".into()));
        }
        let catalog = self.catalog.lock().await;
        let start = (offset as usize).min(catalog.len());
        let end = (offset as usize + limit as usize).min(catalog.len());
        Ok(catalog[start..end].to_vec())
    }

    async fn fetch_components(
        &self,
        asset_id: i64,
        component_type: ComponentType,
    ) -> Result<Vec<RawRecord>, ClientError> {
        if let (Some(writer), ComponentType::Processor) = (&self.writer, component_type) {
            let write = outbox::enqueue(writer, asset_id, "written during sync", None);
            let landed = matches!(
                tokio::time::timeout(Duration::from_secs(1), write).await,
                Ok(Ok(_))
            );
            self.writes.lock().await.push(landed);
        }
        match self.components.lock().await.get(&(asset_id, component_type)) {
            Some(Ok(items)) => Ok(items.clone()),
            Some(Err(msg)) => Err(ClientError::Decode(msg.clone())),
            None => Ok(Vec::new()),
        }
    }
}

fn engine(pool: &Pool, fake: &FakeInventory) -> SyncEngine {
    SyncEngine::new(pool.clone(), Arc::new(fake.clone()), SyncTracker::new())
}

#[tokio::test]
async fn second_run_changes_timestamps_only() {
    let pool = setup_pool().await;
    let fake = FakeInventory::with_catalog(3);
    for id in 1..=3 {
        fake.set_components(id, ComponentType::Processor, vec![part("cpu")])
            .await;
        fake.set_components(id, ComponentType::Memory, vec![part("dimm")])
            .await;
    }
    let engine = engine(&pool, &fake);

    let first = engine.run_full_sync().await.unwrap();
    assert_eq!(first.assets_synced, 3);
    assert_eq!(first.components_synced, 6);
    assert_eq!(first.message, "Synced 3 assets and 6 components");
    let before = db::get_asset_by_external_id(&pool, 2).await.unwrap().unwrap();

    let second = engine.run_full_sync().await.unwrap();
    assert_eq!(second, first);
    assert_eq!(db::count_assets(&pool).await.unwrap(), 3);
    assert_eq!(db::count_components(&pool).await.unwrap(), 6);

    let after = db::get_asset_by_external_id(&pool, 2).await.unwrap().unwrap();
    assert_eq!(after.id, before.id);
    assert_eq!(after.name, before.name);
    assert_eq!(after.location, before.location);
    assert_eq!(after.raw_snapshot, before.raw_snapshot);
    assert_eq!(after.created_at, before.created_at);
    assert!(after.updated_at > before.updated_at);
}

#[tokio::test]
async fn dropdowns_are_stored_resolved() {
    let pool = setup_pool().await;
    let fake = FakeInventory::with_catalog(1);
    engine(&pool, &fake).run_full_sync().await.unwrap();

    let asset = db::get_asset_by_external_id(&pool, 1).await.unwrap().unwrap();
    assert_eq!(asset.location, "Building A > Room 1");
    assert_eq!(asset.status, "42");
    assert_eq!(asset.entity, "Root entity");
    assert_eq!(asset.asset_tag, "TAG-1");
    assert_eq!(asset.serial, "SN0001");
}

#[tokio::test]
async fn full_page_triggers_one_extra_fetch() {
    let pool = setup_pool().await;
    let fake = FakeInventory::with_catalog(PAGE_SIZE as i64);
    engine(&pool, &fake).run_full_sync().await.unwrap();
    assert_eq!(fake.page_calls().await, vec![(0, 50), (50, 50)]);
    assert_eq!(db::count_assets(&pool).await.unwrap(), 50);
}

#[tokio::test]
async fn short_page_ends_pagination() {
    let pool = setup_pool().await;
    let fake = FakeInventory::with_catalog(PAGE_SIZE as i64 - 1);
    engine(&pool, &fake).run_full_sync().await.unwrap();
    assert_eq!(fake.page_calls().await, vec![(0, 50)]);
    assert_eq!(db::count_assets(&pool).await.unwrap(), 49);
}

#[tokio::test]
async fn pages_advance_in_offset_order() {
    let pool = setup_pool().await;
    let fake = FakeInventory::with_catalog(120);
    let result = engine(&pool, &fake).run_full_sync().await.unwrap();
    assert_eq!(result.assets_synced, 120);
    assert_eq!(fake.page_calls().await, vec![(0, 50), (50, 50), (100, 50)]);
}

#[tokio::test]
async fn components_are_replaced_not_merged() {
    let pool = setup_pool().await;
    let fake = FakeInventory::with_catalog(1);
    fake.set_components(
        1,
        ComponentType::HardDrive,
        vec![part("ssd-a"), part("ssd-b"), part("hdd-c")],
    )
    .await;
    let engine = engine(&pool, &fake);
    engine.run_full_sync().await.unwrap();

    let asset = db::get_asset_by_external_id(&pool, 1).await.unwrap().unwrap();
    assert_eq!(db::list_components(&pool, asset.id).await.unwrap().len(), 3);

    fake.set_components(1, ComponentType::HardDrive, vec![part("ssd-a")])
        .await;
    engine.run_full_sync().await.unwrap();

    let components = db::list_components(&pool, asset.id).await.unwrap();
    assert_eq!(components.len(), 1);
    assert_eq!(components[0].name, "ssd-a");
    assert_eq!(components[0].component_type, ComponentType::HardDrive.as_str());
}

#[tokio::test]
async fn failed_component_type_is_not_fatal_and_keeps_rows() {
    let pool = setup_pool().await;
    let fake = FakeInventory::with_catalog(2);
    fake.set_components(1, ComponentType::Memory, vec![part("dimm-1"), part("dimm-2")])
        .await;
    fake.set_components(1, ComponentType::Processor, vec![part("old-cpu")])
        .await;
    let engine = engine(&pool, &fake);
    engine.run_full_sync().await.unwrap();

    fake.fail_components(1, ComponentType::Memory).await;
    fake.set_components(1, ComponentType::Processor, vec![part("new-cpu")])
        .await;
    let result = engine.run_full_sync().await.unwrap();
    assert_eq!(result.assets_synced, 2);

    let asset = db::get_asset_by_external_id(&pool, 1).await.unwrap().unwrap();
    let components = db::list_components(&pool, asset.id).await.unwrap();
    let names: Vec<_> = components.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(components.len(), 3);
    assert!(names.contains(&"dimm-1"));
    assert!(names.contains(&"dimm-2"));
    assert!(names.contains(&"new-cpu"));
    assert!(!names.contains(&"old-cpu"));
}

#[tokio::test]
async fn page_failure_keeps_committed_pages() {
    let pool = setup_pool().await;
    let fake = FakeInventory::with_catalog(120);
    *fake.fail_page_at.lock().await = Some(100);
    let engine = engine(&pool, &fake);

    let err = engine.run_full_sync().await.unwrap_err();
    match &err {
        SyncError::PageFetch {
            offset, committed, ..
        } => {
            assert_eq!(*offset, 100);
            assert_eq!(committed.assets, 100);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(db::count_assets(&pool).await.unwrap(), 100);
    assert_eq!(*fake.closed.lock().await, 1);

    let status = engine.tracker().snapshot();
    assert!(!status.running);
    assert_eq!(status.assets_synced, 100);
    assert!(status.last_error.unwrap().contains("offset 100"));
}

#[tokio::test]
async fn rejected_credentials_abort_before_any_page() {
    let pool = setup_pool().await;
    let fake = FakeInventory {
        reject_auth: true,
        ..FakeInventory::with_catalog(5)
    };
    let engine = engine(&pool, &fake);

    let err = engine.run_full_sync().await.unwrap_err();
    assert!(matches!(err, SyncError::Auth(ClientError::Auth(_))));
    assert!(fake.page_calls().await.is_empty());
    assert_eq!(db::count_assets(&pool).await.unwrap(), 0);
    assert_eq!(*fake.closed.lock().await, 1);
    assert!(!engine.tracker().is_running());
}

#[tokio::test]
async fn records_without_id_are_skipped() {
    let pool = setup_pool().await;
    let fake = FakeInventory::with_catalog(2);
    fake.catalog
        .lock()
        .await
        .push(record(json!({"name": "orphan"})));

    let result = engine(&pool, &fake).run_full_sync().await.unwrap();
    assert_eq!(result.assets_synced, 2);
    assert_eq!(db::count_assets(&pool).await.unwrap(), 2);
}

#[tokio::test]
async fn concurrent_first_syncs_create_one_row_per_asset() {
    let pool = setup_pool().await;
    let fake = FakeInventory::with_catalog(4);
    fake.set_components(3, ComponentType::NetworkCard, vec![part("eth0")])
        .await;
    let a = engine(&pool, &fake);
    let b = engine(&pool, &fake);

    let (ra, rb) = tokio::join!(a.run_full_sync(), b.run_full_sync());
    assert_eq!(ra.unwrap().assets_synced, 4);
    assert_eq!(rb.unwrap().assets_synced, 4);
    assert_eq!(db::count_assets(&pool).await.unwrap(), 4);
    assert_eq!(db::count_components(&pool).await.unwrap(), 1);
}

#[tokio::test]
async fn overlapping_triggers_never_start_a_second_run() {
    let pool = setup_pool().await;
    let gate = Arc::new(Semaphore::new(0));
    let fake = FakeInventory {
        gate: Some(gate.clone()),
        ..FakeInventory::with_catalog(3)
    };
    let supervisor = SyncSupervisor::new(engine(&pool, &fake));

    let started = supervisor.trigger(TriggerMode::Background).await.unwrap();
    assert_eq!(started, TriggerOutcome::Started);
    assert!(supervisor.status().running);

    assert_eq!(
        supervisor.trigger(TriggerMode::Blocking).await.unwrap(),
        TriggerOutcome::AlreadyRunning
    );
    assert_eq!(
        supervisor.trigger(TriggerMode::Background).await.unwrap(),
        TriggerOutcome::AlreadyRunning
    );

    gate.add_permits(1);
    supervisor.join_background().await;

    let status = supervisor.status();
    assert!(!status.running);
    assert_eq!(status.assets_synced, 3);
    assert_eq!(status.message.as_deref(), Some("Synced 3 assets and 0 components"));
    assert_eq!(*fake.opened.lock().await, 1);
    assert_eq!(fake.page_calls().await, vec![(0, 50)]);
}

#[tokio::test]
async fn blocking_trigger_returns_the_result() {
    let pool = setup_pool().await;
    let fake = FakeInventory::with_catalog(2);
    fake.set_components(1, ComponentType::GraphicCard, vec![part("gpu")])
        .await;
    let supervisor = SyncSupervisor::new(engine(&pool, &fake));

    let outcome = supervisor.trigger(TriggerMode::Blocking).await.unwrap();
    assert_eq!(outcome.message(), "Synced 2 assets and 1 components");
    match outcome {
        TriggerOutcome::Completed(result) => {
            assert_eq!(result.assets_synced, 2);
            assert_eq!(result.components_synced, 1);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(supervisor.status().finished_at.is_some());
}

#[tokio::test]
async fn blocking_trigger_surfaces_failure_with_progress() {
    let pool = setup_pool().await;
    let fake = FakeInventory::with_catalog(60);
    *fake.fail_page_at.lock().await = Some(50);
    let supervisor = SyncSupervisor::new(engine(&pool, &fake));

    let err = supervisor.trigger(TriggerMode::Blocking).await.unwrap_err();
    assert_eq!(err.committed().assets, 50);
    assert!(err.to_string().contains("after 50 assets"));
    assert!(supervisor.status().last_error.is_some());
}

#[tokio::test]
async fn background_failure_is_reported_through_status() {
    let pool = setup_pool().await;
    let fake = FakeInventory::with_catalog(60);
    *fake.fail_page_at.lock().await = Some(50);
    let supervisor = SyncSupervisor::new(engine(&pool, &fake));

    assert_eq!(
        supervisor.trigger(TriggerMode::Background).await.unwrap(),
        TriggerOutcome::Started
    );
    supervisor.join_background().await;

    let status = supervisor.status();
    assert!(!status.running);
    assert_eq!(status.assets_synced, 50);
    assert!(status.last_error.unwrap().contains("after 50 assets"));
    assert_eq!(*fake.closed.lock().await, 1);
}

#[tokio::test]
async fn store_stays_writable_while_components_are_fetched() {
    let pool = setup_pool().await;
    let mut fake = FakeInventory::with_catalog(3);
    fake.writer = Some(pool.clone());
    for id in 1..=3 {
        fake.set_components(id, ComponentType::Processor, vec![part("cpu")])
            .await;
    }

    let result = engine(&pool, &fake).run_full_sync().await.unwrap();
    assert_eq!(result.assets_synced, 3);
    assert_eq!(result.components_synced, 3);

    assert_eq!(*fake.writes.lock().await, vec![true; 3]);
    assert_eq!(db::count_outbox(&pool, OutboxStatus::Pending).await.unwrap(), 3);
}
