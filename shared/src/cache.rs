//! Durable, owner-partitioned snapshot cache. Never touches the network.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, OnceCell};
use tracing::{debug, error, info, instrument, warn};

use crate::codec::{CodecError, SnapshotCodec};
use crate::model::{CachedSnapshot, EntityId, EntityKind, OwnerId, SnapshotKey};
use crate::notify::{Advisory, AdvisorySlot, Notifier};
use crate::storage::{LocalStorage, StorageError, StoredRecord};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache could not be opened: {0}")]
    InitFailed(#[source] StorageError),

    #[error("cache storage: {0}")]
    Storage(#[from] StorageError),

    #[error("cache codec: {0}")]
    Codec(#[from] CodecError),

    #[error("snapshot {found} filed under {expected}")]
    Misfiled { expected: String, found: String },
}

/// Emitted after a change is durable, so readers can re-read the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    Upserted(SnapshotKey),
    Removed(SnapshotKey),
    Remapped {
        owner: OwnerId,
        kind: EntityKind,
        from: EntityId,
        to: EntityId,
    },
    Replaced {
        owner: OwnerId,
        kind: EntityKind,
        count: usize,
    },
}

pub struct LocalCache {
    storage: Arc<dyn LocalStorage>,
    codec: SnapshotCodec,
    notifier: Arc<dyn Notifier>,
    ready: OnceCell<()>,
    unavailable_shown: AtomicBool,
    events: broadcast::Sender<CacheEvent>,
}

impl LocalCache {
    pub fn new(
        storage: Arc<dyn LocalStorage>,
        codec: SnapshotCodec,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            storage,
            codec,
            notifier,
            ready: OnceCell::new(),
            unavailable_shown: AtomicBool::new(false),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    /// Opens the backing store. Idempotent; a failure is not remembered, so
    /// the next call tries again.
    pub async fn init(&self) -> Result<(), CacheError> {
        if self.ready.initialized() {
            return Ok(());
        }

        match self.ready.get_or_try_init(|| self.storage.init()).await {
            Ok(()) => {
                if self.unavailable_shown.swap(false, Ordering::SeqCst) {
                    self.notifier.dismiss(AdvisorySlot::Storage);
                }
                info!("local cache ready");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "local cache init failed");
                self.unavailable_shown.store(true, Ordering::SeqCst);
                self.notifier.show(Advisory::StorageUnavailable {
                    message: format!("Local storage is unavailable: {e}"),
                    retryable: true,
                });
                Err(CacheError::InitFailed(e))
            }
        }
    }

    /// Every snapshot of `(owner, kind)`, tombstones included. Rows that fail
    /// to decode are skipped.
    #[instrument(skip(self), fields(%owner, %kind))]
    pub async fn get(
        &self,
        owner: &OwnerId,
        kind: EntityKind,
    ) -> Result<Vec<CachedSnapshot>, CacheError> {
        self.init().await?;
        let rows = self.storage.load_snapshots(owner, kind).await?;

        let mut snapshots = Vec::with_capacity(rows.len());
        for row in rows {
            match self.decode(owner, kind, &row) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => warn!(id = %row.id, error = %e, "skipping unreadable snapshot"),
            }
        }
        snapshots.sort_by(|a, b| {
            a.entity
                .created_at
                .cmp(&b.entity.created_at)
                .then_with(|| a.id().cmp(b.id()))
        });
        Ok(snapshots)
    }

    /// What the UI lists: everything but tombstones.
    pub async fn visible(
        &self,
        owner: &OwnerId,
        kind: EntityKind,
    ) -> Result<Vec<CachedSnapshot>, CacheError> {
        let mut snapshots = self.get(owner, kind).await?;
        snapshots.retain(CachedSnapshot::is_visible);
        Ok(snapshots)
    }

    pub async fn get_one(
        &self,
        owner: &OwnerId,
        kind: EntityKind,
        id: &EntityId,
    ) -> Result<Option<CachedSnapshot>, CacheError> {
        self.init().await?;
        match self.storage.load_snapshot(owner, kind, id).await? {
            Some(row) => Ok(Some(self.decode(owner, kind, &row)?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self, snapshot), fields(%owner, %kind, id = %snapshot.id()))]
    pub async fn put(
        &self,
        owner: &OwnerId,
        kind: EntityKind,
        snapshot: &CachedSnapshot,
    ) -> Result<(), CacheError> {
        self.init().await?;
        let record = self.to_record(owner, kind, snapshot)?;
        self.storage.save_snapshot(&record).await?;
        debug!(status = snapshot.entity.sync_status.as_str(), "snapshot stored");
        let _ = self.events.send(CacheEvent::Upserted(snapshot.key()));
        Ok(())
    }

    #[instrument(skip(self), fields(%owner, %kind, %id))]
    pub async fn remove(
        &self,
        owner: &OwnerId,
        kind: EntityKind,
        id: &EntityId,
    ) -> Result<bool, CacheError> {
        self.init().await?;
        let removed = self.storage.delete_snapshot(owner, kind, id).await?;
        if removed {
            let _ = self.events.send(CacheEvent::Removed(SnapshotKey {
                owner: owner.clone(),
                kind,
                id: id.clone(),
            }));
        }
        Ok(removed)
    }

    /// Replaces the whole `(owner, kind)` partition.
    #[instrument(skip(self, snapshots), fields(%owner, %kind, count = snapshots.len()))]
    pub async fn bulk_sync(
        &self,
        owner: &OwnerId,
        kind: EntityKind,
        snapshots: &[CachedSnapshot],
    ) -> Result<(), CacheError> {
        self.init().await?;
        let records = snapshots
            .iter()
            .map(|s| self.to_record(owner, kind, s))
            .collect::<Result<Vec<_>, _>>()?;
        self.storage.replace_snapshots(owner, kind, &records).await?;
        info!("cache partition replaced");
        let _ = self.events.send(CacheEvent::Replaced {
            owner: owner.clone(),
            kind,
            count: records.len(),
        });
        Ok(())
    }

    /// Moves a snapshot from `from` to its current id in one storage step.
    #[instrument(skip(self, snapshot), fields(%owner, %from, to = %snapshot.id()))]
    pub async fn rekey(
        &self,
        owner: &OwnerId,
        from: &EntityId,
        snapshot: &CachedSnapshot,
    ) -> Result<(), CacheError> {
        self.init().await?;
        let kind = snapshot.entity.kind();
        let record = self.to_record(owner, kind, snapshot)?;
        self.storage.rekey_snapshot(from, &record).await?;
        let _ = self.events.send(CacheEvent::Remapped {
            owner: owner.clone(),
            kind,
            from: from.clone(),
            to: snapshot.id().clone(),
        });
        Ok(())
    }

    fn to_record(
        &self,
        owner: &OwnerId,
        kind: EntityKind,
        snapshot: &CachedSnapshot,
    ) -> Result<StoredRecord, CacheError> {
        if &snapshot.entity.owner != owner || snapshot.entity.kind() != kind {
            return Err(CacheError::Misfiled {
                expected: format!("{owner}/{kind}"),
                found: snapshot.key().to_string(),
            });
        }
        Ok(StoredRecord {
            owner: owner.clone(),
            kind,
            id: snapshot.id().clone(),
            sync_status: snapshot.entity.sync_status,
            updated_at: snapshot.entity.updated_at,
            body: self.codec.encode(snapshot)?,
        })
    }

    fn decode(
        &self,
        owner: &OwnerId,
        kind: EntityKind,
        row: &StoredRecord,
    ) -> Result<CachedSnapshot, CodecError> {
        let key = SnapshotKey {
            owner: owner.clone(),
            kind,
            id: row.id.clone(),
        };
        self.codec.decode(&key, &row.body)
    }
}
