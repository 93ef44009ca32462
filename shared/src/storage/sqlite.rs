use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{info, instrument};

use super::{LocalStorage, StorageError, StoredAction, StoredRecord};
use crate::model::{ActionId, EntityId, EntityKind, OwnerId, SyncStatus, UnixTimeMs};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS snapshots (
    owner TEXT NOT NULL,
    kind TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    sync_status TEXT NOT NULL,
    updated_at INTEGER NOT NULL,
    body BLOB NOT NULL,
    PRIMARY KEY (owner, kind, entity_id)
);
CREATE INDEX IF NOT EXISTS idx_snapshots_owner_kind ON snapshots(owner, kind);
CREATE INDEX IF NOT EXISTS idx_snapshots_owner_status ON snapshots(owner, sync_status);

CREATE TABLE IF NOT EXISTS offline_actions (
    owner TEXT NOT NULL,
    action_id TEXT NOT NULL,
    ts INTEGER NOT NULL,
    body BLOB NOT NULL,
    PRIMARY KEY (owner, action_id)
);
CREATE INDEX IF NOT EXISTS idx_actions_owner_ts ON offline_actions(owner, ts);
"#;

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        match e.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked) => {
                StorageError::Busy(e.to_string())
            }
            Some(rusqlite::ErrorCode::CannotOpen | rusqlite::ErrorCode::NotADatabase) => {
                StorageError::Unavailable(e.to_string())
            }
            _ => StorageError::Backend(e.to_string()),
        }
    }
}

enum Location {
    File(PathBuf),
    Memory,
}

/// SQLite-backed substrate. Every call runs on the blocking pool.
pub struct SqliteStorage {
    location: Location,
    conn: OnceCell<Arc<Mutex<Connection>>>,
}

impl SqliteStorage {
    /// The file is not touched until [`LocalStorage::init`].
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            location: Location::File(path.as_ref().to_path_buf()),
            conn: OnceCell::new(),
        }
    }

    pub fn new_in_memory() -> Self {
        Self {
            location: Location::Memory,
            conn: OnceCell::new(),
        }
    }

    async fn open(&self) -> Result<Arc<Mutex<Connection>>, StorageError> {
        let path = match &self.location {
            Location::File(path) => Some(path.clone()),
            Location::Memory => None,
        };
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, StorageError> {
            let conn = match path {
                Some(path) => Connection::open(path),
                None => Connection::open_in_memory(),
            }
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
            conn.busy_timeout(BUSY_TIMEOUT)?;
            conn.execute_batch(SCHEMA)?;
            Ok(conn)
        })
        .await
        .map_err(|e| StorageError::Backend(format!("blocking task failed: {e}")))??;
        Ok(Arc::new(Mutex::new(conn)))
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StorageError> + Send + 'static,
    {
        let conn = Arc::clone(self.conn.get().ok_or(StorageError::NotInitialized)?);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| StorageError::LockPoisoned)?;
            f(&mut *guard)
        })
        .await
        .map_err(|e| StorageError::Backend(format!("blocking task failed: {e}")))?
    }
}

fn read_record(
    owner: &OwnerId,
    kind: EntityKind,
    row: &rusqlite::Row<'_>,
) -> rusqlite::Result<StoredRecord> {
    let status: String = row.get(1)?;
    let updated_at: i64 = row.get(2)?;
    Ok(StoredRecord {
        owner: owner.clone(),
        kind,
        id: EntityId::new(row.get::<_, String>(0)?),
        sync_status: SyncStatus::parse(&status).unwrap_or_default(),
        updated_at: UnixTimeMs(updated_at.max(0) as u64),
        body: row.get(3)?,
    })
}

fn upsert_record(conn: &Connection, record: &StoredRecord) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO snapshots (owner, kind, entity_id, sync_status, updated_at, body)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(owner, kind, entity_id) DO UPDATE SET
             sync_status = excluded.sync_status,
             updated_at = excluded.updated_at,
             body = excluded.body",
        params![
            record.owner.as_str(),
            record.kind.as_str(),
            record.id.as_str(),
            record.sync_status.as_str(),
            record.updated_at.as_millis() as i64,
            record.body,
        ],
    )
}

fn upsert_action(conn: &Connection, owner: &OwnerId, action: &StoredAction) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO offline_actions (owner, action_id, ts, body)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(owner, action_id) DO UPDATE SET
             ts = excluded.ts,
             body = excluded.body",
        params![
            owner.as_str(),
            action.id.as_str(),
            action.timestamp.as_millis() as i64,
            action.body,
        ],
    )
}

#[async_trait]
impl LocalStorage for SqliteStorage {
    #[instrument(skip(self))]
    async fn init(&self) -> Result<(), StorageError> {
        self.conn.get_or_try_init(|| self.open()).await?;
        info!("sqlite storage ready");
        Ok(())
    }

    async fn load_snapshots(
        &self,
        owner: &OwnerId,
        kind: EntityKind,
    ) -> Result<Vec<StoredRecord>, StorageError> {
        let owner = owner.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT entity_id, sync_status, updated_at, body FROM snapshots
                 WHERE owner = ?1 AND kind = ?2 ORDER BY entity_id",
            )?;
            let rows = stmt
                .query_map(params![owner.as_str(), kind.as_str()], |row| {
                    read_record(&owner, kind, row)
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    async fn load_snapshot(
        &self,
        owner: &OwnerId,
        kind: EntityKind,
        id: &EntityId,
    ) -> Result<Option<StoredRecord>, StorageError> {
        let owner = owner.clone();
        let id = id.clone();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT entity_id, sync_status, updated_at, body FROM snapshots
                     WHERE owner = ?1 AND kind = ?2 AND entity_id = ?3",
                    params![owner.as_str(), kind.as_str(), id.as_str()],
                    |row| read_record(&owner, kind, row),
                )
                .optional()?;
            Ok(row)
        })
        .await
    }

    async fn save_snapshot(&self, record: &StoredRecord) -> Result<(), StorageError> {
        let record = record.clone();
        self.with_conn(move |conn| {
            upsert_record(conn, &record)?;
            Ok(())
        })
        .await
    }

    async fn delete_snapshot(
        &self,
        owner: &OwnerId,
        kind: EntityKind,
        id: &EntityId,
    ) -> Result<bool, StorageError> {
        let (owner, id) = (owner.clone(), id.clone());
        self.with_conn(move |conn| {
            let n = conn.execute(
                "DELETE FROM snapshots WHERE owner = ?1 AND kind = ?2 AND entity_id = ?3",
                params![owner.as_str(), kind.as_str(), id.as_str()],
            )?;
            Ok(n > 0)
        })
        .await
    }

    async fn rekey_snapshot(
        &self,
        from: &EntityId,
        record: &StoredRecord,
    ) -> Result<(), StorageError> {
        let (from, record) = (from.clone(), record.clone());
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM snapshots WHERE owner = ?1 AND kind = ?2 AND entity_id = ?3",
                params![record.owner.as_str(), record.kind.as_str(), from.as_str()],
            )?;
            upsert_record(&tx, &record)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn replace_snapshots(
        &self,
        owner: &OwnerId,
        kind: EntityKind,
        records: &[StoredRecord],
    ) -> Result<(), StorageError> {
        let owner = owner.clone();
        let records = records.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM snapshots WHERE owner = ?1 AND kind = ?2",
                params![owner.as_str(), kind.as_str()],
            )?;
            for record in &records {
                upsert_record(&tx, record)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn load_actions(&self, owner: &OwnerId) -> Result<Vec<StoredAction>, StorageError> {
        let owner = owner.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT action_id, ts, body FROM offline_actions
                 WHERE owner = ?1 ORDER BY ts ASC, action_id ASC",
            )?;
            let rows = stmt
                .query_map(params![owner.as_str()], |row| {
                    let ts: i64 = row.get(1)?;
                    Ok(StoredAction {
                        id: ActionId::new(row.get::<_, String>(0)?),
                        timestamp: UnixTimeMs(ts.max(0) as u64),
                        body: row.get(2)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    async fn save_action(
        &self,
        owner: &OwnerId,
        action: &StoredAction,
    ) -> Result<(), StorageError> {
        let (owner, action) = (owner.clone(), action.clone());
        self.with_conn(move |conn| {
            upsert_action(conn, &owner, &action)?;
            Ok(())
        })
        .await
    }

    async fn save_actions(
        &self,
        owner: &OwnerId,
        actions: &[StoredAction],
    ) -> Result<(), StorageError> {
        let owner = owner.clone();
        let actions = actions.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            for action in &actions {
                upsert_action(&tx, &owner, action)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn delete_action(&self, owner: &OwnerId, id: &ActionId) -> Result<bool, StorageError> {
        let (owner, id) = (owner.clone(), id.clone());
        self.with_conn(move |conn| {
            let n = conn.execute(
                "DELETE FROM offline_actions WHERE owner = ?1 AND action_id = ?2",
                params![owner.as_str(), id.as_str()],
            )?;
            Ok(n > 0)
        })
        .await
    }
}
