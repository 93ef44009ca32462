//! Per-entity serialization shared by the pipeline and the reconciler.
//!
//! Holding an [`EntityGuard`] means no other mutation or replay step touches
//! that entity until the guard drops. [`EntityLocks::lock_all`] waits for every
//! guard and blocks new ones, for work that rewrites a whole cache partition.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::model::EntityId;

#[derive(Default)]
pub struct EntityLocks {
    partition: RwLock<()>,
    slots: Mutex<HashMap<EntityId, Arc<Mutex<()>>>>,
}

/// Drop order matters: the entity slot is released before the partition.
pub struct EntityGuard<'a> {
    id: EntityId,
    _entity: OwnedMutexGuard<()>,
    _partition: RwLockReadGuard<'a, ()>,
}

impl EntityGuard<'_> {
    pub fn id(&self) -> &EntityId {
        &self.id
    }
}

impl EntityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, id: &EntityId) -> EntityGuard<'_> {
        // Partition first; taking it after the slot could deadlock against
        // a queued `lock_all`.
        let partition = self.partition.read().await;
        let slot = {
            let mut slots = self.slots.lock().await;
            // Slots nobody holds or waits on.
            slots.retain(|_, slot| Arc::strong_count(slot) > 1);
            Arc::clone(slots.entry(id.clone()).or_default())
        };
        let entity = slot.lock_owned().await;
        EntityGuard {
            id: id.clone(),
            _entity: entity,
            _partition: partition,
        }
    }

    pub async fn lock_all(&self) -> RwLockWriteGuard<'_, ()> {
        self.partition.write().await
    }

    /// Entities currently held or awaited.
    pub async fn contended(&self) -> usize {
        self.slots
            .lock()
            .await
            .values()
            .filter(|slot| Arc::strong_count(slot) > 1)
            .count()
    }
}
