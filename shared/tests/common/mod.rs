#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use tasknotes_sync::codec::SnapshotCodec;
use tasknotes_sync::notify::RecordingNotifier;
use tasknotes_sync::storage::{StoredAction, StoredRecord};
use tasknotes_sync::{
    ActionId, ConnectivityMonitor, DrainOutcome, DrainReport, EntityId, EntityKind, EntityPatch,
    EntityPayload, HealthProbe, LocalCache, LocalStorage, MutationPipeline, OfflineQueue, OwnerId,
    Reconciler, RemoteError, RemoteRecord, RemoteStore, StorageError, SyncConfig, UnixTimeMs,
};

// ============================================================================
// Remote
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    Create { kind: EntityKind, title: String },
    Update { kind: EntityKind, id: EntityId },
    Delete { kind: EntityKind, id: EntityId },
    List { kind: EntityKind },
}

/// In-memory server. Every call is recorded before any scripted failure applies.
#[derive(Default)]
pub struct FakeRemote {
    records: Mutex<BTreeMap<EntityId, RemoteRecord>>,
    calls: Mutex<Vec<RemoteCall>>,
    next_id: AtomicU64,
    scripted: Mutex<VecDeque<RemoteError>>,
    always: Mutex<Option<RemoteError>>,
    delay: Mutex<Option<Duration>>,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn creates(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, RemoteCall::Create { .. }))
            .count()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn records(&self) -> Vec<RemoteRecord> {
        self.records.lock().unwrap().values().cloned().collect()
    }

    pub fn record(&self, id: &EntityId) -> Option<RemoteRecord> {
        self.records.lock().unwrap().get(id).cloned()
    }

    /// Puts a record on the server without going through the client.
    pub fn seed(&self, owner: &OwnerId, payload: EntityPayload) -> EntityId {
        let id = self.mint();
        self.records.lock().unwrap().insert(
            id.clone(),
            RemoteRecord {
                id: id.clone(),
                owner: owner.clone(),
                payload,
                updated_at: UnixTimeMs::now(),
            },
        );
        id
    }

    /// The next call fails with `err`.
    pub fn fail_next(&self, err: RemoteError) {
        self.scripted.lock().unwrap().push_back(err);
    }

    /// Every call fails with `err` until cleared with `None`.
    pub fn fail_always(&self, err: Option<RemoteError>) {
        *self.always.lock().unwrap() = err;
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap() = delay;
    }

    fn mint(&self) -> EntityId {
        EntityId::new(format!("srv-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1))
    }

    async fn enter(&self, call: RemoteCall) -> Result<(), RemoteError> {
        self.calls.lock().unwrap().push(call);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.scripted.lock().unwrap().pop_front() {
            return Err(err);
        }
        if let Some(err) = self.always.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for FakeRemote {
    async fn create(
        &self,
        owner: &OwnerId,
        payload: &EntityPayload,
    ) -> Result<EntityId, RemoteError> {
        self.enter(RemoteCall::Create {
            kind: payload.kind(),
            title: payload.title().to_string(),
        })
        .await?;
        Ok(self.seed(owner, payload.clone()))
    }

    async fn update(
        &self,
        kind: EntityKind,
        id: &EntityId,
        patch: &EntityPatch,
    ) -> Result<(), RemoteError> {
        self.enter(RemoteCall::Update {
            kind,
            id: id.clone(),
        })
        .await?;
        let mut records = self.records.lock().unwrap();
        let record = records
            .get_mut(id)
            .ok_or_else(|| RemoteError::from_status(404, format!("{id} not found")))?;
        record
            .payload
            .apply(patch)
            .map_err(|e| RemoteError::from_status(422, e.to_string()))?;
        record.updated_at = UnixTimeMs::now();
        Ok(())
    }

    async fn delete(&self, kind: EntityKind, id: &EntityId) -> Result<(), RemoteError> {
        self.enter(RemoteCall::Delete {
            kind,
            id: id.clone(),
        })
        .await?;
        match self.records.lock().unwrap().remove(id) {
            Some(_) => Ok(()),
            None => Err(RemoteError::from_status(404, format!("{id} not found"))),
        }
    }

    async fn list_all(
        &self,
        kind: EntityKind,
        owner: &OwnerId,
    ) -> Result<Vec<RemoteRecord>, RemoteError> {
        // The listing reflects the server when the request arrived.
        let listing = self
            .records()
            .into_iter()
            .filter(|r| r.payload.kind() == kind && &r.owner == owner)
            .collect();
        self.enter(RemoteCall::List { kind }).await?;
        Ok(listing)
    }
}

// ============================================================================
// Probe
// ============================================================================

pub struct ScriptedProbe {
    reachable: AtomicBool,
}

impl ScriptedProbe {
    pub fn new(reachable: bool) -> Arc<Self> {
        Arc::new(Self {
            reachable: AtomicBool::new(reachable),
        })
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn probe(&self) -> Result<(), RemoteError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RemoteError::from_status(511, "network authentication required"))
        }
    }
}

// ============================================================================
// Storage with failure injection
// ============================================================================

pub struct FlakyStorage {
    inner: Arc<dyn LocalStorage>,
    pub fail_snapshot_writes: AtomicBool,
    pub fail_action_writes: AtomicBool,
}

impl FlakyStorage {
    pub fn new(inner: Arc<dyn LocalStorage>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            fail_snapshot_writes: AtomicBool::new(false),
            fail_action_writes: AtomicBool::new(false),
        })
    }

    fn check(flag: &AtomicBool) -> Result<(), StorageError> {
        if flag.load(Ordering::SeqCst) {
            Err(StorageError::Backend("disk full".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl LocalStorage for FlakyStorage {
    async fn init(&self) -> Result<(), StorageError> {
        self.inner.init().await
    }

    async fn load_snapshots(
        &self,
        owner: &OwnerId,
        kind: EntityKind,
    ) -> Result<Vec<StoredRecord>, StorageError> {
        self.inner.load_snapshots(owner, kind).await
    }

    async fn load_snapshot(
        &self,
        owner: &OwnerId,
        kind: EntityKind,
        id: &EntityId,
    ) -> Result<Option<StoredRecord>, StorageError> {
        self.inner.load_snapshot(owner, kind, id).await
    }

    async fn save_snapshot(&self, record: &StoredRecord) -> Result<(), StorageError> {
        Self::check(&self.fail_snapshot_writes)?;
        self.inner.save_snapshot(record).await
    }

    async fn delete_snapshot(
        &self,
        owner: &OwnerId,
        kind: EntityKind,
        id: &EntityId,
    ) -> Result<bool, StorageError> {
        Self::check(&self.fail_snapshot_writes)?;
        self.inner.delete_snapshot(owner, kind, id).await
    }

    async fn rekey_snapshot(
        &self,
        from: &EntityId,
        record: &StoredRecord,
    ) -> Result<(), StorageError> {
        Self::check(&self.fail_snapshot_writes)?;
        self.inner.rekey_snapshot(from, record).await
    }

    async fn replace_snapshots(
        &self,
        owner: &OwnerId,
        kind: EntityKind,
        records: &[StoredRecord],
    ) -> Result<(), StorageError> {
        Self::check(&self.fail_snapshot_writes)?;
        self.inner.replace_snapshots(owner, kind, records).await
    }

    async fn load_actions(&self, owner: &OwnerId) -> Result<Vec<StoredAction>, StorageError> {
        self.inner.load_actions(owner).await
    }

    async fn save_action(&self, owner: &OwnerId, action: &StoredAction) -> Result<(), StorageError> {
        Self::check(&self.fail_action_writes)?;
        self.inner.save_action(owner, action).await
    }

    async fn save_actions(
        &self,
        owner: &OwnerId,
        actions: &[StoredAction],
    ) -> Result<(), StorageError> {
        Self::check(&self.fail_action_writes)?;
        self.inner.save_actions(owner, actions).await
    }

    async fn delete_action(&self, owner: &OwnerId, id: &ActionId) -> Result<bool, StorageError> {
        Self::check(&self.fail_action_writes)?;
        self.inner.delete_action(owner, id).await
    }
}

// ============================================================================
// Rig: the engine's wiring without its background loops
// ============================================================================

/// Retries are due immediately so tests can drain repeatedly.
pub fn test_config() -> SyncConfig {
    let mut config = SyncConfig::default();
    config.queue.base_backoff_ms = 0;
    config.queue.max_jitter_ms = 0;
    config.connectivity.probe_timeout_ms = 200;
    config.remote_timeout_ms = 2_000;
    config
}

pub struct Rig {
    pub owner: OwnerId,
    pub remote: Arc<FakeRemote>,
    pub probe: Arc<ScriptedProbe>,
    pub notifier: Arc<RecordingNotifier>,
    pub cache: Arc<LocalCache>,
    pub queue: Arc<OfflineQueue>,
    pub monitor: Arc<ConnectivityMonitor>,
    pub pipeline: MutationPipeline,
    pub reconciler: Reconciler,
}

impl Rig {
    pub async fn new(storage: Arc<dyn LocalStorage>) -> Self {
        Self::with_config(storage, FakeRemote::new(), test_config()).await
    }

    pub async fn with_config(
        storage: Arc<dyn LocalStorage>,
        remote: Arc<FakeRemote>,
        config: SyncConfig,
    ) -> Self {
        let owner = OwnerId::new("alice");
        let probe = ScriptedProbe::new(true);
        let notifier = Arc::new(RecordingNotifier::new());
        let cache = Arc::new(LocalCache::new(
            Arc::clone(&storage),
            SnapshotCodec::plain(),
            notifier.clone(),
        ));
        cache.init().await.unwrap();
        let queue = Arc::new(OfflineQueue::new(owner.clone(), storage, config.queue.clone()));
        queue.init().await.unwrap();
        let monitor = Arc::new(ConnectivityMonitor::new(
            probe.clone(),
            notifier.clone(),
            config.connectivity.clone(),
        ));
        let kick = Arc::new(Notify::new());
        let pipeline = MutationPipeline::new(
            owner.clone(),
            Arc::clone(&cache),
            Arc::clone(&queue),
            remote.clone(),
            Arc::clone(&monitor),
            notifier.clone(),
            config.remote_timeout(),
            Arc::clone(&kick),
        );
        let reconciler = Reconciler::new(
            owner.clone(),
            Arc::clone(&cache),
            Arc::clone(&queue),
            remote.clone(),
            Arc::clone(&monitor),
            notifier.clone(),
            config.remote_timeout(),
            kick,
        );
        Self {
            owner,
            remote,
            probe,
            notifier,
            cache,
            queue,
            monitor,
            pipeline,
            reconciler,
        }
    }

    pub async fn go_online(&self) {
        self.probe.set_reachable(true);
        self.monitor.set_network_present(true).await;
        assert!(self.monitor.is_fully_online());
    }

    pub async fn go_offline(&self) {
        self.monitor.set_network_present(false).await;
    }

    pub async fn drain(&self) -> DrainReport {
        match self.reconciler.drain().await.unwrap() {
            DrainOutcome::Completed(report) => report,
            other => panic!("drain did not run: {other:?}"),
        }
    }

    /// Drains until the queue is empty or no further progress is made.
    pub async fn drain_to_empty(&self) {
        for _ in 0..10 {
            if self.queue.is_empty().await {
                return;
            }
            let report = self.drain().await;
            if report.attempted() == 0 && report.discarded == 0 {
                return;
            }
        }
    }
}
