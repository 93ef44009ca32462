//! Optimistic mutations: the cache is written first, then the remote is tried
//! directly or the change is queued.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info, instrument, warn};

use crate::cache::LocalCache;
use crate::connectivity::ConnectivityMonitor;
use crate::error::{SyncError, SyncResult};
use crate::identity::{mint_local_id, promote};
use crate::model::{
    CachedSnapshot, Entity, EntityId, EntityKind, EntityPatch, EntityPayload, OwnerId,
    SyncStatus, UnixTimeMs,
};
use crate::notify::{Advisory, Notifier};
use crate::outbox::{ActionOp, OfflineQueue};
use crate::remote::{with_timeout, RemoteStore};

/// What to put back if queueing fails after the cache was already written.
enum Rollback {
    Remove { kind: EntityKind, id: EntityId },
    Restore(CachedSnapshot),
    Nothing,
}

pub struct MutationPipeline {
    owner: OwnerId,
    cache: Arc<LocalCache>,
    queue: Arc<OfflineQueue>,
    remote: Arc<dyn RemoteStore>,
    monitor: Arc<ConnectivityMonitor>,
    notifier: Arc<dyn Notifier>,
    remote_timeout: Duration,
    kick: Arc<Notify>,
}

impl MutationPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        owner: OwnerId,
        cache: Arc<LocalCache>,
        queue: Arc<OfflineQueue>,
        remote: Arc<dyn RemoteStore>,
        monitor: Arc<ConnectivityMonitor>,
        notifier: Arc<dyn Notifier>,
        remote_timeout: Duration,
        kick: Arc<Notify>,
    ) -> Self {
        Self {
            owner,
            cache,
            queue,
            remote,
            monitor,
            notifier,
            remote_timeout,
            kick,
        }
    }

    pub async fn list(&self, kind: EntityKind) -> SyncResult<Vec<Entity>> {
        let snapshots = self.cache.visible(&self.owner, kind).await?;
        Ok(snapshots.into_iter().map(|s| s.entity).collect())
    }

    /// Accepts ids handed out before a promotion.
    pub async fn get(&self, kind: EntityKind, id: &EntityId) -> SyncResult<Option<Entity>> {
        Ok(self
            .find(kind, id)
            .await?
            .filter(CachedSnapshot::is_visible)
            .map(|s| s.entity))
    }

    #[instrument(skip(self, payload), fields(owner = %self.owner, kind = %payload.kind()))]
    pub async fn create(&self, payload: EntityPayload) -> SyncResult<Entity> {
        payload.validate()?;
        let kind = payload.kind();
        let online = self.monitor.is_fully_online();
        let now = UnixTimeMs::now();
        let local_id = mint_local_id();
        // Held until the create is queued or promoted, so edits and replays
        // of this id wait for it.
        let _guard = self.queue.locks().lock(&local_id).await;

        let snapshot = CachedSnapshot::new(Entity {
            id: local_id.clone(),
            owner: self.owner.clone(),
            payload,
            created_at: now,
            updated_at: now,
            sync_status: if online {
                SyncStatus::Synced
            } else {
                SyncStatus::Pending
            },
            is_local: true,
        });
        self.write_local(kind, &snapshot).await?;

        if online {
            let call = self.remote.create(&self.owner, &snapshot.entity.payload);
            match with_timeout(self.remote_timeout, call).await {
                Ok(server_id) => {
                    debug!(%local_id, %server_id, "created remotely");
                    return match promote(
                        &self.cache,
                        &self.queue,
                        &self.owner,
                        kind,
                        &local_id,
                        &server_id,
                    )
                    .await
                    {
                        Ok(Some(promoted)) => Ok(promoted.entity),
                        Ok(None) => Err(SyncError::NotFound { kind, id: local_id }),
                        Err(e) => Err(self.local_failure(kind, e)),
                    };
                }
                Err(e) => warn!(%local_id, error = %e, "remote create failed, queueing"),
            }
        }

        // Queue what the cache holds now, not what was sent.
        let mut current = if online {
            self.cache
                .get_one(&self.owner, kind, &local_id)
                .await
                .map_err(|e| self.local_failure(kind, e.into()))?
                .unwrap_or(snapshot)
        } else {
            snapshot
        };
        current.entity.sync_status = SyncStatus::Pending;
        let op = ActionOp::Create {
            entity_id: local_id.clone(),
            payload: current.entity.payload.clone(),
        };
        let rollback = Rollback::Remove { kind, id: local_id };
        // Offline, the cached entry is already Pending.
        self.queue_change(op, online.then_some(&current), rollback)
            .await?;
        Ok(current.entity)
    }

    #[instrument(skip(self, patch), fields(owner = %self.owner, %kind, %id))]
    pub async fn update(
        &self,
        kind: EntityKind,
        id: &EntityId,
        patch: EntityPatch,
    ) -> SyncResult<Entity> {
        let _guard = self.queue.lock_current(id).await;
        let previous = self.find_visible(kind, id).await?;
        let mut snapshot = previous.clone();
        snapshot.entity.payload.apply(&patch)?;
        snapshot.entity.payload.validate()?;
        snapshot.entity.updated_at = UnixTimeMs::now();

        let direct = self.can_go_direct(&snapshot.entity.id).await;
        snapshot.entity.sync_status = if direct {
            SyncStatus::Synced
        } else {
            SyncStatus::Pending
        };
        self.write_local(kind, &snapshot).await?;
        let target = snapshot.entity.id.clone();

        if direct {
            let call = self.remote.update(kind, &target, &patch);
            match with_timeout(self.remote_timeout, call).await {
                Ok(()) => {
                    debug!("updated remotely");
                    return Ok(snapshot.entity);
                }
                Err(e) => warn!(error = %e, "remote update failed, queueing"),
            }
            snapshot.entity.sync_status = SyncStatus::Pending;
        }

        let op = ActionOp::Update {
            entity_id: target,
            patch,
        };
        self.queue_change(op, direct.then_some(&snapshot), Rollback::Restore(previous))
            .await?;
        Ok(snapshot.entity)
    }

    /// The entry is tombstoned only once the delete is confirmed or queued.
    #[instrument(skip(self), fields(owner = %self.owner, %kind, %id))]
    pub async fn delete(&self, kind: EntityKind, id: &EntityId) -> SyncResult<()> {
        let _guard = self.queue.lock_current(id).await;
        let Some(snapshot) = self.find(kind, id).await? else {
            return Err(SyncError::NotFound {
                kind,
                id: id.clone(),
            });
        };
        if snapshot.tombstone {
            debug!("already deleted");
            return Ok(());
        }
        let target = snapshot.entity.id.clone();

        if self.can_go_direct(&target).await {
            let call = self.remote.delete(kind, &target);
            match with_timeout(self.remote_timeout, call).await {
                Ok(()) => return self.forget(kind, &target).await,
                Err(e) if e.is_not_found() => {
                    debug!("already gone remotely");
                    return self.forget(kind, &target).await;
                }
                Err(e) => warn!(error = %e, "remote delete failed, queueing"),
            }
        }

        let mut tombstone = snapshot;
        tombstone.tombstone = true;
        tombstone.entity.sync_status = SyncStatus::Pending;
        tombstone.entity.updated_at = UnixTimeMs::now();
        let op = ActionOp::Delete {
            entity_id: target,
            kind,
        };
        self.queue_change(op, Some(&tombstone), Rollback::Nothing)
            .await
    }

    /// Fully online, server-known, and nothing queued ahead of it.
    async fn can_go_direct(&self, id: &EntityId) -> bool {
        self.monitor.is_fully_online() && !id.is_local() && !self.queue.has_pending_for(id).await
    }

    /// Looks the entity up under its current id, then under the id the
    /// caller holds in case the cache was never rekeyed.
    async fn find(&self, kind: EntityKind, id: &EntityId) -> SyncResult<Option<CachedSnapshot>> {
        let resolved = self.queue.resolve(id).await;
        if let Some(found) = self.cache.get_one(&self.owner, kind, &resolved).await? {
            return Ok(Some(found));
        }
        if &resolved != id {
            return Ok(self.cache.get_one(&self.owner, kind, id).await?);
        }
        Ok(None)
    }

    async fn find_visible(&self, kind: EntityKind, id: &EntityId) -> SyncResult<CachedSnapshot> {
        self.find(kind, id)
            .await?
            .filter(CachedSnapshot::is_visible)
            .ok_or_else(|| SyncError::NotFound {
                kind,
                id: id.clone(),
            })
    }

    async fn write_local(&self, kind: EntityKind, snapshot: &CachedSnapshot) -> SyncResult<()> {
        self.cache
            .put(&self.owner, kind, snapshot)
            .await
            .map_err(|e| self.local_failure(kind, e.into()))
    }

    async fn forget(&self, kind: EntityKind, id: &EntityId) -> SyncResult<()> {
        self.cache
            .remove(&self.owner, kind, id)
            .await
            .map_err(|e| self.local_failure(kind, e.into()))?;
        debug!("deleted remotely");
        Ok(())
    }

    /// Queues `op`, then writes `snapshot` if given. A failure at either step
    /// undoes what was already done locally.
    async fn queue_change(
        &self,
        op: ActionOp,
        snapshot: Option<&CachedSnapshot>,
        rollback: Rollback,
    ) -> SyncResult<()> {
        let kind = op.kind();
        let entity_id = op.entity_id().clone();

        let action = match self.queue.enqueue(op).await {
            Ok(action) => action,
            Err(e) => {
                self.roll_back(rollback).await;
                return Err(self.local_failure(kind, e.into()));
            }
        };

        if let Some(snapshot) = snapshot {
            if let Err(e) = self.cache.put(&self.owner, kind, snapshot).await {
                if let Err(discard) = self.queue.discard_action(&action.id).await {
                    error!(action_id = %action.id, error = %discard, "could not withdraw queued action");
                }
                self.roll_back(rollback).await;
                return Err(self.local_failure(kind, e.into()));
            }
        }

        info!(
            action = action.op.type_name(),
            %entity_id,
            action_id = %action.id,
            "saved offline"
        );
        self.notifier.show(Advisory::SavedOffline {
            kind,
            id: entity_id,
        });
        if self.monitor.is_fully_online() {
            self.kick.notify_one();
        }
        Ok(())
    }

    async fn roll_back(&self, rollback: Rollback) {
        let result = match &rollback {
            Rollback::Remove { kind, id } => {
                self.cache.remove(&self.owner, *kind, id).await.map(|_| ())
            }
            Rollback::Restore(previous) => {
                self.cache
                    .put(&self.owner, previous.entity.kind(), previous)
                    .await
            }
            Rollback::Nothing => Ok(()),
        };
        if let Err(e) = result {
            error!(error = %e, "rollback failed");
        }
    }

    fn local_failure(&self, kind: EntityKind, err: SyncError) -> SyncError {
        error!(%kind, error = %err, code = err.code(), "local write failed");
        self.notifier.show(Advisory::LocalWriteFailed {
            kind,
            message: err.user_facing_message(),
        });
        err
    }
}
