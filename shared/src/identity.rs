//! Local identities and their promotion to server identities.

use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, instrument, warn};

use crate::cache::LocalCache;
use crate::error::SyncResult;
use crate::model::{
    CachedSnapshot, EntityId, EntityKind, OwnerId, SyncStatus, UnixTimeMs, LOCAL_ID_PREFIX,
};
use crate::outbox::OfflineQueue;

static LOCAL_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// `local_{millis}_{random}_{counter}`. The counter makes ids unique within
/// the process even when the clock and the random suffix collide.
pub fn mint_local_id() -> EntityId {
    let millis = UnixTimeMs::now().as_millis();
    let suffix: u32 = rand::random();
    let seq = LOCAL_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    EntityId::new(format!("{LOCAL_ID_PREFIX}{millis}_{suffix:08x}_{seq}"))
}

/// Replaces `local` with `server` everywhere: the queue's remap table and
/// queued actions first, then the cache key.
///
/// The snapshot becomes `Synced` only if no queued work still targets it.
/// Returns `None` when the cache no longer holds the entity.
#[instrument(skip(cache, queue), fields(%owner, %kind, %local, %server))]
pub async fn promote(
    cache: &LocalCache,
    queue: &OfflineQueue,
    owner: &OwnerId,
    kind: EntityKind,
    local: &EntityId,
    server: &EntityId,
) -> SyncResult<Option<CachedSnapshot>> {
    queue.remap_entity(local, server).await?;

    let Some(mut snapshot) = cache.get_one(owner, kind, local).await? else {
        warn!("promoted entity no longer cached");
        return Ok(None);
    };

    snapshot.entity.id = server.clone();
    snapshot.entity.is_local = false;
    snapshot.entity.sync_status = if queue.has_pending_for(server).await {
        SyncStatus::Pending
    } else {
        SyncStatus::Synced
    };
    cache.rekey(owner, local, &snapshot).await?;

    info!(status = snapshot.entity.sync_status.as_str(), "local id promoted");
    Ok(Some(snapshot))
}
