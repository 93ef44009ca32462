use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use super::{LocalStorage, StorageError, StoredAction, StoredRecord};
use crate::model::{ActionId, EntityId, EntityKind, OwnerId};

type Partition = (OwnerId, EntityKind);

#[derive(Default)]
struct Tables {
    snapshots: HashMap<Partition, BTreeMap<EntityId, StoredRecord>>,
    actions: HashMap<OwnerId, BTreeMap<ActionId, StoredAction>>,
}

/// Process-local backend. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStorage {
    tables: RwLock<Tables>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot_count(&self, owner: &OwnerId) -> usize {
        let tables = self.tables.read().await;
        tables
            .snapshots
            .iter()
            .filter(|((o, _), _)| o == owner)
            .map(|(_, rows)| rows.len())
            .sum()
    }

    pub async fn action_count(&self, owner: &OwnerId) -> usize {
        let tables = self.tables.read().await;
        tables.actions.get(owner).map_or(0, BTreeMap::len)
    }
}

#[async_trait]
impl LocalStorage for MemoryStorage {
    async fn init(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn load_snapshots(
        &self,
        owner: &OwnerId,
        kind: EntityKind,
    ) -> Result<Vec<StoredRecord>, StorageError> {
        let tables = self.tables.read().await;
        Ok(tables
            .snapshots
            .get(&(owner.clone(), kind))
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn load_snapshot(
        &self,
        owner: &OwnerId,
        kind: EntityKind,
        id: &EntityId,
    ) -> Result<Option<StoredRecord>, StorageError> {
        let tables = self.tables.read().await;
        Ok(tables
            .snapshots
            .get(&(owner.clone(), kind))
            .and_then(|rows| rows.get(id))
            .cloned())
    }

    async fn save_snapshot(&self, record: &StoredRecord) -> Result<(), StorageError> {
        let mut tables = self.tables.write().await;
        tables
            .snapshots
            .entry((record.owner.clone(), record.kind))
            .or_default()
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn delete_snapshot(
        &self,
        owner: &OwnerId,
        kind: EntityKind,
        id: &EntityId,
    ) -> Result<bool, StorageError> {
        let mut tables = self.tables.write().await;
        Ok(tables
            .snapshots
            .get_mut(&(owner.clone(), kind))
            .and_then(|rows| rows.remove(id))
            .is_some())
    }

    async fn rekey_snapshot(
        &self,
        from: &EntityId,
        record: &StoredRecord,
    ) -> Result<(), StorageError> {
        let mut tables = self.tables.write().await;
        let rows = tables
            .snapshots
            .entry((record.owner.clone(), record.kind))
            .or_default();
        rows.remove(from);
        rows.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn replace_snapshots(
        &self,
        owner: &OwnerId,
        kind: EntityKind,
        records: &[StoredRecord],
    ) -> Result<(), StorageError> {
        let rows = records
            .iter()
            .map(|r| (r.id.clone(), r.clone()))
            .collect::<BTreeMap<_, _>>();
        let mut tables = self.tables.write().await;
        tables.snapshots.insert((owner.clone(), kind), rows);
        Ok(())
    }

    async fn load_actions(&self, owner: &OwnerId) -> Result<Vec<StoredAction>, StorageError> {
        let tables = self.tables.read().await;
        let mut actions: Vec<StoredAction> = tables
            .actions
            .get(owner)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default();
        actions.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(actions)
    }

    async fn save_action(
        &self,
        owner: &OwnerId,
        action: &StoredAction,
    ) -> Result<(), StorageError> {
        let mut tables = self.tables.write().await;
        tables
            .actions
            .entry(owner.clone())
            .or_default()
            .insert(action.id.clone(), action.clone());
        Ok(())
    }

    async fn save_actions(
        &self,
        owner: &OwnerId,
        actions: &[StoredAction],
    ) -> Result<(), StorageError> {
        let mut tables = self.tables.write().await;
        let rows = tables.actions.entry(owner.clone()).or_default();
        for action in actions {
            rows.insert(action.id.clone(), action.clone());
        }
        Ok(())
    }

    async fn delete_action(&self, owner: &OwnerId, id: &ActionId) -> Result<bool, StorageError> {
        let mut tables = self.tables.write().await;
        Ok(tables
            .actions
            .get_mut(owner)
            .and_then(|rows| rows.remove(id))
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SyncStatus, UnixTimeMs};

    fn record(owner: &str, id: &str) -> StoredRecord {
        StoredRecord {
            owner: OwnerId::new(owner),
            kind: EntityKind::Task,
            id: EntityId::new(id),
            sync_status: SyncStatus::Pending,
            updated_at: UnixTimeMs(1),
            body: vec![1, 2, 3],
        }
    }

    #[tokio::test]
    async fn owners_are_partitioned() {
        let storage = MemoryStorage::new();
        storage.save_snapshot(&record("alice", "t1")).await.unwrap();
        storage.save_snapshot(&record("bob", "t2")).await.unwrap();

        let alice = storage
            .load_snapshots(&OwnerId::new("alice"), EntityKind::Task)
            .await
            .unwrap();
        assert_eq!(alice.len(), 1);
        assert_eq!(alice[0].id, EntityId::new("t1"));
        assert!(storage
            .load_snapshots(&OwnerId::new("alice"), EntityKind::Note)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn rekey_moves_row() {
        let storage = MemoryStorage::new();
        storage.save_snapshot(&record("alice", "local_1")).await.unwrap();
        storage
            .rekey_snapshot(&EntityId::new("local_1"), &record("alice", "srv-1"))
            .await
            .unwrap();

        let owner = OwnerId::new("alice");
        assert!(storage
            .load_snapshot(&owner, EntityKind::Task, &EntityId::new("local_1"))
            .await
            .unwrap()
            .is_none());
        assert!(storage
            .load_snapshot(&owner, EntityKind::Task, &EntityId::new("srv-1"))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn actions_load_in_timestamp_order() {
        let storage = MemoryStorage::new();
        let owner = OwnerId::new("alice");
        for (id, ts) in [("b", 30), ("a", 10), ("c", 20)] {
            storage
                .save_action(
                    &owner,
                    &StoredAction {
                        id: ActionId::new(id),
                        timestamp: UnixTimeMs(ts),
                        body: Vec::new(),
                    },
                )
                .await
                .unwrap();
        }
        let ids: Vec<_> = storage
            .load_actions(&owner)
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.id.0)
            .collect();
        assert_eq!(ids, ["a", "c", "b"]);

        assert!(storage.delete_action(&owner, &ActionId::new("c")).await.unwrap());
        assert!(!storage.delete_action(&owner, &ActionId::new("c")).await.unwrap());
        assert_eq!(storage.action_count(&owner).await, 2);
    }
}
