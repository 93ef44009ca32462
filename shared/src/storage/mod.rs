//! Persistence substrate: owner-partitioned rows for cached snapshots and
//! queued actions. Bodies are opaque bytes; encoding belongs to the layer above.

mod memory;
#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
mod sqlite;

pub use self::memory::MemoryStorage;
#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
pub use self::sqlite::SqliteStorage;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{ActionId, EntityId, EntityKind, OwnerId, SyncStatus, UnixTimeMs};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("storage not initialized")]
    NotInitialized,

    #[error("storage busy: {0}")]
    Busy(String),

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("storage lock poisoned")]
    LockPoisoned,
}

impl StorageError {
    /// Contention that usually clears on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy(_) | Self::NotInitialized)
    }
}

/// One cached snapshot row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub owner: OwnerId,
    pub kind: EntityKind,
    pub id: EntityId,
    pub sync_status: SyncStatus,
    pub updated_at: UnixTimeMs,
    pub body: Vec<u8>,
}

/// One queued action row. `timestamp` is the replay order key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAction {
    pub id: ActionId,
    pub timestamp: UnixTimeMs,
    pub body: Vec<u8>,
}

#[async_trait]
pub trait LocalStorage: Send + Sync {
    /// Opens and migrates the backing store. Must be idempotent.
    async fn init(&self) -> Result<(), StorageError>;

    async fn load_snapshots(
        &self,
        owner: &OwnerId,
        kind: EntityKind,
    ) -> Result<Vec<StoredRecord>, StorageError>;

    async fn load_snapshot(
        &self,
        owner: &OwnerId,
        kind: EntityKind,
        id: &EntityId,
    ) -> Result<Option<StoredRecord>, StorageError>;

    /// Insert or overwrite.
    async fn save_snapshot(&self, record: &StoredRecord) -> Result<(), StorageError>;

    async fn delete_snapshot(
        &self,
        owner: &OwnerId,
        kind: EntityKind,
        id: &EntityId,
    ) -> Result<bool, StorageError>;

    /// Writes `record` and deletes the row stored under `from` in one step.
    async fn rekey_snapshot(
        &self,
        from: &EntityId,
        record: &StoredRecord,
    ) -> Result<(), StorageError>;

    /// Replaces every row of `(owner, kind)` with `records`.
    async fn replace_snapshots(
        &self,
        owner: &OwnerId,
        kind: EntityKind,
        records: &[StoredRecord],
    ) -> Result<(), StorageError>;

    /// Every queued action for `owner`, oldest first.
    async fn load_actions(&self, owner: &OwnerId) -> Result<Vec<StoredAction>, StorageError>;

    async fn save_action(&self, owner: &OwnerId, action: &StoredAction)
        -> Result<(), StorageError>;

    /// Upserts all of `actions` atomically.
    async fn save_actions(
        &self,
        owner: &OwnerId,
        actions: &[StoredAction],
    ) -> Result<(), StorageError>;

    async fn delete_action(&self, owner: &OwnerId, id: &ActionId) -> Result<bool, StorageError>;
}
