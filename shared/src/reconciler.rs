//! Replays the offline queue against the remote once fully online.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::cache::LocalCache;
use crate::connectivity::{ConnectivityEvent, ConnectivityMonitor};
use crate::error::SyncResult;
use crate::identity::promote;
use crate::model::{
    ActionId, CachedSnapshot, Entity, EntityId, EntityKind, EntityPayload, OwnerId, SyncStatus,
    UnixTimeMs,
};
use crate::notify::{Advisory, Notifier};
use crate::outbox::{ActionOp, OfflineAction, OfflineQueue};
use crate::remote::{with_timeout, RemoteError, RemoteStore};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Actions settled by a confirmed remote call.
    pub synced: usize,
    /// Actions whose remote call failed this pass.
    pub failed: usize,
    /// Actions not attempted: not yet due, or behind a failure on the same entity.
    pub skipped: usize,
    /// Local create/delete pairs dropped without a network call.
    pub discarded: usize,
    pub dead_lettered: usize,
}

impl DrainReport {
    pub fn attempted(&self) -> usize {
        self.synced + self.failed
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    AlreadyRunning,
    NotOnline,
    Completed(DrainReport),
}

/// One unit of replay work.
#[derive(Debug)]
enum Step {
    /// A Create with the Updates that followed it folded into its payload.
    Create {
        entity_id: EntityId,
        payload: EntityPayload,
        covers: Vec<ActionId>,
    },
    /// A Create later deleted: nothing needs to reach the remote.
    DiscardLocal {
        entity_id: EntityId,
        kind: EntityKind,
        covers: Vec<ActionId>,
    },
    Single(ActionId),
}

/// Groups queued actions on a local id with that id's Create. A local Create
/// that was later deleted is discarded even if it is dead-lettered.
fn plan(actions: &[OfflineAction], now: UnixTimeMs) -> Vec<Step> {
    let mut steps = Vec::new();
    let mut consumed: HashSet<&ActionId> = HashSet::new();

    for (i, action) in actions.iter().enumerate() {
        if consumed.contains(&action.id) {
            continue;
        }
        let ActionOp::Create { entity_id, payload } = &action.op else {
            steps.push(Step::Single(action.id.clone()));
            continue;
        };
        if !entity_id.is_local() {
            steps.push(Step::Single(action.id.clone()));
            continue;
        }

        let mut folded = payload.clone();
        let mut covers = vec![&action.id];
        let mut deleted = false;
        for later in actions[i + 1..].iter().filter(|a| a.entity_id() == entity_id) {
            match &later.op {
                ActionOp::Update { patch, .. } => {
                    let mut candidate = folded.clone();
                    if candidate.apply(patch).is_err() {
                        break;
                    }
                    folded = candidate;
                    covers.push(&later.id);
                }
                ActionOp::Delete { .. } => {
                    covers.push(&later.id);
                    deleted = true;
                    break;
                }
                ActionOp::Create { .. } => break,
            }
        }

        if deleted {
            consumed.extend(covers.iter().copied());
            steps.push(Step::DiscardLocal {
                entity_id: entity_id.clone(),
                kind: payload.kind(),
                covers: covers.into_iter().cloned().collect(),
            });
        } else if action.is_due(now) && !action.is_dead_letter() {
            consumed.extend(covers.iter().copied());
            steps.push(Step::Create {
                entity_id: entity_id.clone(),
                payload: folded,
                covers: covers.into_iter().cloned().collect(),
            });
        } else {
            steps.push(Step::Single(action.id.clone()));
        }
    }
    steps
}

pub struct Reconciler {
    owner: OwnerId,
    cache: Arc<LocalCache>,
    queue: Arc<OfflineQueue>,
    remote: Arc<dyn RemoteStore>,
    monitor: Arc<ConnectivityMonitor>,
    notifier: Arc<dyn Notifier>,
    remote_timeout: Duration,
    kick: Arc<Notify>,
    gate: Mutex<()>,
}

impl Reconciler {
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
            gate: Mutex::new(()),
        }
    }

    /// One replay pass. A call made while another pass runs returns at once.
    #[instrument(skip(self), fields(owner = %self.owner))]
    pub async fn drain(&self) -> SyncResult<DrainOutcome> {
        let Ok(_gate) = self.gate.try_lock() else {
            debug!("drain already running");
            return Ok(DrainOutcome::AlreadyRunning);
        };
        if !self.monitor.is_fully_online() {
            debug!("not fully online, drain skipped");
            return Ok(DrainOutcome::NotOnline);
        }

        self.queue.init().await?;
        self.queue.reset_in_flight().await;
        let adopted = self.queue.reconcile_persisted().await?;
        if adopted > 0 {
            info!(adopted, "queue reconciled with persisted copy");
        }

        let actions = self.queue.snapshot().await;
        let steps = plan(&actions, UnixTimeMs::now());
        let mut report = DrainReport::default();
        let mut blocked: HashSet<EntityId> = HashSet::new();

        for step in steps {
            match step {
                Step::DiscardLocal {
                    entity_id,
                    kind,
                    covers,
                } => {
                    let _guard = self.queue.locks().lock(&entity_id).await;
                    self.queue.complete(&covers).await;
                    if let Err(e) = self.cache.remove(&self.owner, kind, &entity_id).await {
                        error!(%entity_id, error = %e, "failed to drop local tombstone");
                    }
                    debug!(%entity_id, actions = covers.len(), "created and deleted offline, dropped");
                    report.discarded += covers.len();
                }
                Step::Create {
                    entity_id,
                    payload,
                    covers,
                } => {
                    if blocked.contains(&entity_id) {
                        report.skipped += covers.len();
                        continue;
                    }
                    if !self.monitor.is_fully_online() {
                        warn!("connectivity lost mid-drain");
                        break;
                    }
                    let _guard = self.queue.locks().lock(&entity_id).await;
                    self.replay_create(&entity_id, payload, &covers, &mut blocked, &mut report)
                        .await;
                }
                Step::Single(id) => {
                    let Some(planned) = self.queue.get(&id).await else {
                        continue;
                    };
                    let _guard = self.queue.lock_current(planned.entity_id()).await;
                    // Re-read under the lock: an earlier step or a pipeline
                    // call may have remapped or settled it.
                    let Some(action) = self.queue.get(&id).await else {
                        continue;
                    };
                    let target = action.entity_id().clone();
                    if blocked.contains(&target) {
                        report.skipped += 1;
                        continue;
                    }
                    if target.is_local() && !matches!(action.op, ActionOp::Create { .. }) {
                        // The server has never seen this id; wait for its Create.
                        debug!(%target, action = action.op.type_name(), "held behind unsent create");
                        blocked.insert(target);
                        report.skipped += 1;
                        continue;
                    }
                    if !action.is_due(UnixTimeMs::now()) {
                        blocked.insert(target);
                        report.skipped += 1;
                        continue;
                    }
                    if !self.monitor.is_fully_online() {
                        warn!("connectivity lost mid-drain");
                        break;
                    }
                    self.replay_single(action, &mut blocked, &mut report).await;
                }
            }
        }

        if report.attempted() > 0 {
            self.notifier.show(Advisory::SyncSummary {
                synced: report.synced,
                failed: report.failed,
                total: report.attempted(),
            });
        }
        info!(
            synced = report.synced,
            failed = report.failed,
            skipped = report.skipped,
            discarded = report.discarded,
            dead_lettered = report.dead_lettered,
            "drain finished"
        );
        Ok(DrainOutcome::Completed(report))
    }

    async fn replay_create(
        &self,
        entity_id: &EntityId,
        payload: EntityPayload,
        covers: &[ActionId],
        blocked: &mut HashSet<EntityId>,
        report: &mut DrainReport,
    ) {
        let Some(lead) = covers.first() else {
            return;
        };
        if let Err(e) = self.queue.mark_in_flight(lead).await {
            warn!(action_id = %lead, error = %e, "queued create vanished");
            return;
        }

        let call = self.remote.create(&self.owner, &payload);
        match with_timeout(self.remote_timeout, call).await {
            Ok(server_id) => {
                self.queue.complete(covers).await;
                report.synced += covers.len();
                debug!(%entity_id, %server_id, folded = covers.len() - 1, "create replayed");
                self.promote(payload.kind(), entity_id, &server_id).await;
            }
            Err(e) => {
                blocked.insert(entity_id.clone());
                report.failed += 1;
                report.skipped += covers.len() - 1;
                self.fail(lead, "create", entity_id, payload.kind(), &e, report)
                    .await;
            }
        }
    }

    async fn replay_single(
        &self,
        action: OfflineAction,
        blocked: &mut HashSet<EntityId>,
        report: &mut DrainReport,
    ) {
        if let Err(e) = self.queue.mark_in_flight(&action.id).await {
            warn!(action_id = %action.id, error = %e, "queued action vanished");
            return;
        }

        let kind = action.op.kind();
        let entity_id = action.entity_id().clone();
        let result = match &action.op {
            ActionOp::Create { payload, .. } => {
                with_timeout(self.remote_timeout, self.remote.create(&self.owner, payload))
                    .await
                    .map(Some)
            }
            ActionOp::Update { patch, .. } => {
                with_timeout(self.remote_timeout, self.remote.update(kind, &entity_id, patch))
                    .await
                    .map(|()| None)
            }
            ActionOp::Delete { .. } => {
                match with_timeout(self.remote_timeout, self.remote.delete(kind, &entity_id))
                    .await
                {
                    Err(e) if e.is_not_found() => Ok(None),
                    other => other.map(|()| None),
                }
            }
        };

        match result {
            Ok(server_id) => {
                self.queue.complete(std::slice::from_ref(&action.id)).await;
                report.synced += 1;
                debug!(action = action.op.type_name(), %entity_id, "action replayed");
                match (&action.op, server_id) {
                    (ActionOp::Create { .. }, Some(server_id)) => {
                        self.promote(kind, &entity_id, &server_id).await;
                    }
                    (ActionOp::Delete { .. }, _) => {
                        if let Err(e) = self.cache.remove(&self.owner, kind, &entity_id).await {
                            error!(%entity_id, error = %e, "failed to drop confirmed tombstone");
                        }
                    }
                    _ => self.settle(kind, &entity_id).await,
                }
            }
            Err(e) => {
                blocked.insert(entity_id.clone());
                report.failed += 1;
                self.fail(&action.id, action.op.type_name(), &entity_id, kind, &e, report)
                    .await;
            }
        }
    }

    async fn promote(&self, kind: EntityKind, local: &EntityId, server: &EntityId) {
        if let Err(e) = promote(&self.cache, &self.queue, &self.owner, kind, local, server).await {
            error!(%local, %server, error = %e, "failed to promote local id");
        }
    }

    /// Marks the snapshot `Synced` once nothing queued targets it.
    async fn settle(&self, kind: EntityKind, id: &EntityId) {
        if self.queue.has_pending_for(id).await {
            return;
        }
        self.set_status(kind, id, SyncStatus::Synced).await;
    }

    async fn set_status(&self, kind: EntityKind, id: &EntityId, status: SyncStatus) {
        let result = match self.cache.get_one(&self.owner, kind, id).await {
            Ok(Some(mut snapshot)) if snapshot.entity.sync_status != status => {
                snapshot.entity.sync_status = status;
                self.cache.put(&self.owner, kind, &snapshot).await
            }
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            error!(%id, status = status.as_str(), error = %e, "failed to update sync status");
        }
    }

    async fn fail(
        &self,
        action_id: &ActionId,
        action_type: &'static str,
        entity_id: &EntityId,
        kind: EntityKind,
        err: &RemoteError,
        report: &mut DrainReport,
    ) {
        match self.queue.record_failure(action_id, err).await {
            Ok(updated) => {
                warn!(
                    action = action_type,
                    %entity_id,
                    attempt = updated.retry.total_attempts,
                    error = %err,
                    "replay failed"
                );
                if updated.is_dead_letter() {
                    report.dead_lettered += 1;
                    self.set_status(kind, entity_id, SyncStatus::Failed).await;
                }
            }
            Err(e) => error!(%action_id, error = %e, "failed to record replay failure"),
        }
    }

    /// Pulls the server copy of `kind` into the cache. Entries with local work
    /// outstanding keep their local version. Waits for in-progress mutations
    /// and replay steps, and holds new ones back until it finishes.
    #[instrument(skip(self), fields(owner = %self.owner, %kind))]
    pub async fn refresh(&self, kind: EntityKind) -> SyncResult<usize> {
        // No mutation or replay step may land between the listing and the
        // partition rewrite.
        let _all = self.queue.locks().lock_all().await;
        let listing = self.remote.list_all(kind, &self.owner);
        let records = with_timeout(self.remote_timeout, listing).await?;
        let local = self.cache.get(&self.owner, kind).await?;

        let mut merged: HashMap<EntityId, CachedSnapshot> = HashMap::new();
        let local_created: HashMap<&EntityId, UnixTimeMs> =
            local.iter().map(|s| (s.id(), s.entity.created_at)).collect();
        for record in records {
            let created_at = local_created
                .get(&record.id)
                .copied()
                .unwrap_or(record.updated_at);
            let snapshot = CachedSnapshot::new(Entity {
                id: record.id.clone(),
                owner: record.owner,
                payload: record.payload,
                created_at,
                updated_at: record.updated_at,
                sync_status: SyncStatus::Synced,
                is_local: false,
            });
            merged.insert(record.id, snapshot);
        }

        let mut kept = 0;
        for snapshot in local {
            let has_local_work = snapshot.tombstone
                || snapshot.entity.is_local
                || !snapshot.entity.sync_status.is_synced()
                || self.queue.has_pending_for(snapshot.id()).await;
            if has_local_work {
                kept += 1;
                merged.insert(snapshot.id().clone(), snapshot);
            }
        }

        let snapshots: Vec<_> = merged.into_values().collect();
        self.cache.bulk_sync(&self.owner, kind, &snapshots).await?;
        info!(total = snapshots.len(), kept_local = kept, "refreshed from remote");
        Ok(snapshots.len())
    }

    /// Drives drains from connectivity events and pipeline kicks until
    /// `shutdown` flips to true.
    pub fn spawn_auto_sync(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        // Subscribe before spawning so no transition is missed.
        let events = self.monitor.subscribe();
        let this = Arc::clone(self);
        tokio::spawn(async move { this.auto_sync(events, shutdown).await })
    }

    async fn auto_sync(
        &self,
        mut events: broadcast::Receiver<ConnectivityEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let debounce = self.monitor.config().sync_debounce();
        info!("auto-sync started");

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(ConnectivityEvent::BecameOnline) => {
                        tokio::select! {
                            _ = tokio::time::sleep(debounce) => {}
                            _ = shutdown.changed() => break,
                        }
                        if !self.monitor.is_fully_online() {
                            debug!("connectivity dropped during debounce");
                            continue;
                        }
                        let pending = self.queue.pending_len().await;
                        self.notifier.show(Advisory::BackOnline { pending });
                        self.drain_logged().await;
                    }
                    Ok(ConnectivityEvent::Probed { reachable: true }) => {
                        if self.queue.has_due(UnixTimeMs::now()).await {
                            self.drain_logged().await;
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "auto-sync lagged behind connectivity events");
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = self.kick.notified() => self.drain_logged().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("auto-sync stopped");
    }

    async fn drain_logged(&self) {
        if let Err(e) = self.drain().await {
            error!(error = %e, code = e.code(), "drain failed");
        }
    }
}
