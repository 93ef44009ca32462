use lru::LruCache;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, error, info, instrument, warn};

use crate::config::QueueConfig;
use crate::locks::{EntityGuard, EntityLocks};
use crate::model::{
    ActionId, EntityId, EntityKind, EntityPatch, EntityPayload, OwnerId, UnixTimeMs,
};
use crate::remote::{ErrorCategory, RemoteError};
use crate::storage::{LocalStorage, StorageError, StoredAction};

// Bounds remap chains; a longer chain means the table is corrupt.
const MAX_REMAP_HOPS: usize = 8;

// ============================================================================
// Actions
// ============================================================================

/// What a queued action does to the remote. Exhaustive by construction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionOp {
    Create {
        entity_id: EntityId,
        payload: EntityPayload,
    },
    Update {
        entity_id: EntityId,
        patch: EntityPatch,
    },
    Delete {
        entity_id: EntityId,
        kind: EntityKind,
    },
}

impl ActionOp {
    pub fn entity_id(&self) -> &EntityId {
        match self {
            ActionOp::Create { entity_id, .. }
            | ActionOp::Update { entity_id, .. }
            | ActionOp::Delete { entity_id, .. } => entity_id,
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            ActionOp::Create { payload, .. } => payload.kind(),
            ActionOp::Update { patch, .. } => patch.kind(),
            ActionOp::Delete { kind, .. } => *kind,
        }
    }

    pub const fn type_name(&self) -> &'static str {
        match self {
            ActionOp::Create { .. } => "create",
            ActionOp::Update { .. } => "update",
            ActionOp::Delete { .. } => "delete",
        }
    }

    fn retarget(&mut self, id: EntityId) {
        match self {
            ActionOp::Create { entity_id, .. }
            | ActionOp::Update { entity_id, .. }
            | ActionOp::Delete { entity_id, .. } => *entity_id = id,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionFailure {
    pub category: ErrorCategory,
    pub message: String,
    pub status: Option<u16>,
    pub at: UnixTimeMs,
}

impl ActionFailure {
    pub fn new(error: &RemoteError, at: UnixTimeMs) -> Self {
        Self {
            category: error.category,
            message: error.message.clone(),
            status: error.status,
            at,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryHistory {
    pub errors: Vec<ActionFailure>,
    pub total_attempts: u32,
    pub rejected_attempts: u32,
}

impl RetryHistory {
    const MAX_HISTORY: usize = 10;

    pub fn record(&mut self, failure: ActionFailure) {
        self.total_attempts = self.total_attempts.saturating_add(1);
        if !failure.category.is_retryable() {
            self.rejected_attempts = self.rejected_attempts.saturating_add(1);
        }
        if self.errors.len() >= Self::MAX_HISTORY {
            self.errors.remove(0);
        }
        self.errors.push(failure);
    }

    pub fn last_error(&self) -> Option<&ActionFailure> {
        self.errors.last()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    MaxRetriesExceeded,
    RejectedByRemote,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ActionState {
    Pending {
        #[serde(default)]
        next_attempt_at: Option<UnixTimeMs>,
    },
    InFlight {
        started_at: UnixTimeMs,
    },
    DeadLetter {
        reason: DeadLetterReason,
        dead_at: UnixTimeMs,
    },
}

impl ActionState {
    pub const fn state_name(&self) -> &'static str {
        match self {
            ActionState::Pending { .. } => "pending",
            ActionState::InFlight { .. } => "in_flight",
            ActionState::DeadLetter { .. } => "dead_letter",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineAction {
    pub id: ActionId,
    pub op: ActionOp,
    /// Replay order key. Strictly increasing within a queue.
    pub timestamp: UnixTimeMs,
    #[serde(default)]
    pub retry: RetryHistory,
    pub state: ActionState,
}

impl OfflineAction {
    fn new(op: ActionOp, timestamp: UnixTimeMs) -> Self {
        Self {
            id: ActionId::generate(),
            op,
            timestamp,
            retry: RetryHistory::default(),
            state: ActionState::Pending {
                next_attempt_at: None,
            },
        }
    }

    pub fn entity_id(&self) -> &EntityId {
        self.op.entity_id()
    }

    pub fn is_dead_letter(&self) -> bool {
        matches!(self.state, ActionState::DeadLetter { .. })
    }

    pub fn is_due(&self, now: UnixTimeMs) -> bool {
        match &self.state {
            ActionState::Pending { next_attempt_at } => next_attempt_at.map_or(true, |t| now >= t),
            ActionState::InFlight { .. } | ActionState::DeadLetter { .. } => false,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("offline queue is full ({0} actions)")]
    Full(usize),

    #[error("action not found: {0}")]
    NotFound(ActionId),

    #[error("queue storage: {0}")]
    Storage(#[from] StorageError),

    #[error("duplicate action: {0}")]
    Duplicate(ActionId),

    #[error("cannot encode action: {0}")]
    Encode(String),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueDepth {
    pub total: usize,
    pub pending: usize,
    pub in_flight: usize,
    pub dead_letter: usize,
    pub quarantined: usize,
    pub by_type: HashMap<&'static str, usize>,
}

// ============================================================================
// Queue
// ============================================================================

struct QueueState {
    /// Append-only, ordered by `timestamp`.
    actions: Vec<OfflineAction>,
    last_timestamp: UnixTimeMs,
    remaps: HashMap<EntityId, EntityId>,
    completed: LruCache<ActionId, UnixTimeMs>,
    quarantined: HashMap<ActionId, String>,
}

impl QueueState {
    fn new(completed_cache_size: usize) -> Self {
        let size = NonZeroUsize::new(completed_cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            actions: Vec::new(),
            last_timestamp: UnixTimeMs::default(),
            remaps: HashMap::new(),
            completed: LruCache::new(size),
            quarantined: HashMap::new(),
        }
    }

    fn resolve(&self, id: &EntityId) -> EntityId {
        let mut current = id;
        for _ in 0..MAX_REMAP_HOPS {
            match self.remaps.get(current) {
                Some(next) => current = next,
                None => break,
            }
        }
        current.clone()
    }

    fn position(&self, id: &ActionId) -> Option<usize> {
        self.actions.iter().position(|a| &a.id == id)
    }

    fn sort(&mut self) {
        self.actions
            .sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        if let Some(last) = self.actions.last() {
            self.last_timestamp = self.last_timestamp.max(last.timestamp);
        }
    }
}

fn encode(action: &OfflineAction) -> Result<StoredAction, QueueError> {
    let body = serde_json::to_vec(action).map_err(|e| QueueError::Encode(e.to_string()))?;
    Ok(StoredAction {
        id: action.id.clone(),
        timestamp: action.timestamp,
        body,
    })
}

/// Decodes persisted rows. Undecodable rows come back separately so the
/// caller can quarantine them; they are never deleted here.
fn decode_rows(rows: Vec<StoredAction>) -> (Vec<OfflineAction>, Vec<(ActionId, String)>) {
    let mut actions = Vec::with_capacity(rows.len());
    let mut bad = Vec::new();
    for row in rows {
        match serde_json::from_slice::<OfflineAction>(&row.body) {
            Ok(action) if action.id != row.id => {
                bad.push((row.id, format!("row holds action {}", action.id)));
            }
            Ok(mut action) => {
                // Nothing is in flight after a restart.
                if matches!(action.state, ActionState::InFlight { .. }) {
                    action.state = ActionState::Pending {
                        next_attempt_at: None,
                    };
                }
                actions.push(action);
            }
            Err(e) => bad.push((row.id, e.to_string())),
        }
    }
    (actions, bad)
}

fn next_timestamp(last: UnixTimeMs) -> UnixTimeMs {
    UnixTimeMs::now().max(last.add_millis(1))
}

fn calculate_backoff(config: &QueueConfig, attempt: u32) -> u64 {
    let exponent = attempt.saturating_sub(1).min(16);
    let base_delay = config.base_backoff_ms.saturating_mul(1u64 << exponent);
    let capped_delay = base_delay.min(config.max_backoff_ms);
    let jitter = if config.max_jitter_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=config.max_jitter_ms)
    };
    capped_delay.saturating_add(jitter)
}

/// Durable, per-owner log of mutations the remote has not confirmed yet.
pub struct OfflineQueue {
    owner: OwnerId,
    storage: Arc<dyn LocalStorage>,
    config: QueueConfig,
    state: RwLock<QueueState>,
    loaded: OnceCell<()>,
    locks: EntityLocks,
}

impl OfflineQueue {
    pub fn new(owner: OwnerId, storage: Arc<dyn LocalStorage>, config: QueueConfig) -> Self {
        let state = QueueState::new(config.completed_cache_size);
        Self {
            owner,
            storage,
            config,
            state: RwLock::new(state),
            loaded: OnceCell::new(),
            locks: EntityLocks::new(),
        }
    }

    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Entity locks for everything that mutates or replays this owner's data.
    pub fn locks(&self) -> &EntityLocks {
        &self.locks
    }

    /// Locks the entity `id` currently resolves to. An id remapped while
    /// waiting is re-resolved and locked again.
    pub async fn lock_current(&self, id: &EntityId) -> EntityGuard<'_> {
        loop {
            let current = self.resolve(id).await;
            let guard = self.locks.lock(&current).await;
            if self.resolve(id).await == current {
                return guard;
            }
            debug!(%id, "entity remapped while waiting for its lock");
        }
    }

    /// Loads persisted actions once. A failed load is retried on the next call.
    pub async fn init(&self) -> Result<(), QueueError> {
        self.loaded.get_or_try_init(|| self.load()).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(owner = %self.owner))]
    async fn load(&self) -> Result<(), QueueError> {
        self.storage.init().await?;
        let rows = self.storage.load_actions(&self.owner).await?;
        let (actions, bad) = decode_rows(rows);

        let mut state = self.state.write().await;
        for (id, reason) in bad {
            warn!(action_id = %id, %reason, "quarantining corrupted action");
            state.quarantined.insert(id, reason);
        }
        state.actions = actions;
        state.sort();

        info!(
            actions = state.actions.len(),
            quarantined = state.quarantined.len(),
            "offline queue loaded"
        );
        Ok(())
    }

    /// Appends an action. Memory first, then storage; a failed write is rolled back.
    #[instrument(
        skip(self, op),
        fields(owner = %self.owner, action = op.type_name(), entity_id = %op.entity_id())
    )]
    pub async fn enqueue(&self, op: ActionOp) -> Result<OfflineAction, QueueError> {
        self.init().await?;
        let mut state = self.state.write().await;

        if state.actions.len() >= self.config.max_entries {
            warn!(max = self.config.max_entries, "offline queue full");
            return Err(QueueError::Full(self.config.max_entries));
        }

        let mut op = op;
        let target = state.resolve(op.entity_id());
        if &target != op.entity_id() {
            op.retarget(target);
        }

        let action = OfflineAction::new(op, next_timestamp(state.last_timestamp));
        if state.position(&action.id).is_some() || state.completed.contains(&action.id) {
            return Err(QueueError::Duplicate(action.id));
        }
        let stored = encode(&action)?;

        let previous_ts = state.last_timestamp;
        state.actions.push(action.clone());
        state.last_timestamp = action.timestamp;

        if let Err(e) = self.storage.save_action(&self.owner, &stored).await {
            state.actions.pop();
            state.last_timestamp = previous_ts;
            error!(error = %e, "failed to persist queued action");
            return Err(e.into());
        }

        debug!(action_id = %action.id, ts = %action.timestamp, "action queued");
        Ok(action)
    }

    pub async fn get(&self, id: &ActionId) -> Option<OfflineAction> {
        let state = self.state.read().await;
        state.position(id).map(|i| state.actions[i].clone())
    }

    /// Every queued action in replay order, dead letters included.
    pub async fn snapshot(&self) -> Vec<OfflineAction> {
        self.state.read().await.actions.clone()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.actions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.actions.is_empty()
    }

    /// Actions that are not dead-lettered.
    pub async fn pending_len(&self) -> usize {
        let state = self.state.read().await;
        state.actions.iter().filter(|a| !a.is_dead_letter()).count()
    }

    pub async fn has_due(&self, now: UnixTimeMs) -> bool {
        let state = self.state.read().await;
        state.actions.iter().any(|a| a.is_due(now))
    }

    pub async fn dead_letters(&self) -> Vec<OfflineAction> {
        let state = self.state.read().await;
        state
            .actions
            .iter()
            .filter(|a| a.is_dead_letter())
            .cloned()
            .collect()
    }

    /// True if any action, in any state, still targets `id` (or what it was remapped to).
    pub async fn has_pending_for(&self, id: &EntityId) -> bool {
        let state = self.state.read().await;
        let id = state.resolve(id);
        state.actions.iter().any(|a| a.entity_id() == &id)
    }

    /// Follows local→server remaps so ids handed out before a promotion keep working.
    pub async fn resolve(&self, id: &EntityId) -> EntityId {
        self.state.read().await.resolve(id)
    }

    /// Points every queued action on `local` at `server` and remembers the mapping.
    #[instrument(skip(self), fields(owner = %self.owner, %local, %server))]
    pub async fn remap_entity(
        &self,
        local: &EntityId,
        server: &EntityId,
    ) -> Result<usize, QueueError> {
        let mut state = self.state.write().await;
        state.remaps.insert(local.clone(), server.clone());

        let mut changed = Vec::new();
        for action in state.actions.iter_mut() {
            if action.entity_id() == local {
                action.op.retarget(server.clone());
                changed.push(encode(action)?);
            }
        }

        if !changed.is_empty() {
            self.storage.save_actions(&self.owner, &changed).await?;
            info!(count = changed.len(), "remapped queued actions");
        }
        Ok(changed.len())
    }

    /// Any action marked in flight before now belongs to an abandoned drain.
    pub async fn reset_in_flight(&self) -> usize {
        let mut state = self.state.write().await;
        let mut reset = 0;
        for action in state.actions.iter_mut() {
            if matches!(action.state, ActionState::InFlight { .. }) {
                action.state = ActionState::Pending {
                    next_attempt_at: None,
                };
                reset += 1;
            }
        }
        reset
    }

    pub async fn mark_in_flight(&self, id: &ActionId) -> Result<(), QueueError> {
        let mut state = self.state.write().await;
        let i = state
            .position(id)
            .ok_or_else(|| QueueError::NotFound(id.clone()))?;
        state.actions[i].state = ActionState::InFlight {
            started_at: UnixTimeMs::now(),
        };
        Ok(())
    }

    /// Drops confirmed actions. Their ids are remembered so a stale persisted
    /// copy is never replayed.
    #[instrument(skip(self, ids), fields(owner = %self.owner, count = ids.len()))]
    pub async fn complete(&self, ids: &[ActionId]) -> usize {
        let now = UnixTimeMs::now();
        let mut removed = 0;
        {
            let mut state = self.state.write().await;
            for id in ids {
                if let Some(i) = state.position(id) {
                    state.actions.remove(i);
                    removed += 1;
                }
                state.completed.put(id.clone(), now);
            }
        }

        for id in ids {
            if let Err(e) = self.storage.delete_action(&self.owner, id).await {
                error!(action_id = %id, error = %e, "failed to delete completed action");
            }
        }
        removed
    }

    /// Records a failed attempt and schedules the retry, or dead-letters the
    /// action once its budget is spent.
    #[instrument(skip(self, error), fields(owner = %self.owner, action_id = %id))]
    pub async fn record_failure(
        &self,
        id: &ActionId,
        error: &RemoteError,
    ) -> Result<OfflineAction, QueueError> {
        let now = UnixTimeMs::now();
        let mut state = self.state.write().await;
        let i = state
            .position(id)
            .ok_or_else(|| QueueError::NotFound(id.clone()))?;

        let action = &mut state.actions[i];
        action.retry.record(ActionFailure::new(error, now));

        let retry = &action.retry;
        action.state = if !error.is_retryable()
            && retry.rejected_attempts >= self.config.max_rejected_attempts
        {
            ActionState::DeadLetter {
                reason: DeadLetterReason::RejectedByRemote,
                dead_at: now,
            }
        } else if retry.total_attempts >= self.config.max_attempts {
            ActionState::DeadLetter {
                reason: DeadLetterReason::MaxRetriesExceeded,
                dead_at: now,
            }
        } else {
            let backoff = calculate_backoff(&self.config, retry.total_attempts);
            ActionState::Pending {
                next_attempt_at: Some(now.add_millis(backoff)),
            }
        };
        let updated = action.clone();

        match &updated.state {
            ActionState::DeadLetter { reason, .. } => warn!(
                action = updated.op.type_name(),
                entity_id = %updated.entity_id(),
                attempts = updated.retry.total_attempts,
                ?reason,
                "action dead-lettered"
            ),
            _ => debug!(
                attempts = updated.retry.total_attempts,
                state = updated.state.state_name(),
                "action will retry"
            ),
        }

        if let Err(e) = self.storage.save_action(&self.owner, &encode(&updated)?).await {
            error!(error = %e, "failed to persist retry state");
        }
        Ok(updated)
    }

    /// Returns every dead letter to pending with a fresh budget.
    #[instrument(skip(self), fields(owner = %self.owner))]
    pub async fn retry_dead_letters(&self) -> Result<usize, QueueError> {
        self.init().await?;
        let mut state = self.state.write().await;
        let mut changed = Vec::new();
        for action in state.actions.iter_mut().filter(|a| a.is_dead_letter()) {
            action.state = ActionState::Pending {
                next_attempt_at: None,
            };
            action.retry.total_attempts = 0;
            action.retry.rejected_attempts = 0;
            changed.push(encode(action)?);
        }
        if !changed.is_empty() {
            self.storage.save_actions(&self.owner, &changed).await?;
            info!(count = changed.len(), "dead letters returned to queue");
        }
        Ok(changed.len())
    }

    /// Drops one action on explicit request, whatever its state.
    #[instrument(skip(self), fields(owner = %self.owner, action_id = %id))]
    pub async fn discard_action(&self, id: &ActionId) -> Result<OfflineAction, QueueError> {
        self.init().await?;
        let mut state = self.state.write().await;
        let i = state
            .position(id)
            .ok_or_else(|| QueueError::NotFound(id.clone()))?;
        let action = state.actions.remove(i);

        if let Err(e) = self.storage.delete_action(&self.owner, id).await {
            state.actions.insert(i, action);
            error!(error = %e, "failed to discard action");
            return Err(e.into());
        }
        state.completed.put(id.clone(), UnixTimeMs::now());
        info!(action = action.op.type_name(), entity_id = %action.entity_id(), "action discarded");
        Ok(action)
    }

    /// Re-reads the persisted log and adopts it when it holds more actions
    /// than memory does. Ids completed in this process are never re-adopted.
    #[instrument(skip(self), fields(owner = %self.owner))]
    pub async fn reconcile_persisted(&self) -> Result<usize, QueueError> {
        self.init().await?;
        let rows = self.storage.load_actions(&self.owner).await?;
        let (persisted, bad) = decode_rows(rows);

        let mut state = self.state.write().await;
        for (id, reason) in bad {
            state.quarantined.entry(id).or_insert(reason);
        }

        let persisted: Vec<_> = persisted
            .into_iter()
            .filter(|a| !state.completed.contains(&a.id))
            .collect();
        if persisted.len() <= state.actions.len() {
            return Ok(0);
        }

        let mut adopted = 0;
        for mut action in persisted {
            if state.position(&action.id).is_some() {
                continue;
            }
            let target = state.resolve(action.entity_id());
            action.op.retarget(target);
            state.actions.push(action);
            adopted += 1;
        }
        state.sort();

        if adopted > 0 {
            warn!(adopted, "adopted persisted actions missing from memory");
        }
        Ok(adopted)
    }

    pub async fn quarantined(&self) -> Vec<(ActionId, String)> {
        let state = self.state.read().await;
        state
            .quarantined
            .iter()
            .map(|(id, reason)| (id.clone(), reason.clone()))
            .collect()
    }

    pub async fn depth(&self) -> QueueDepth {
        let state = self.state.read().await;
        let mut depth = QueueDepth {
            total: state.actions.len(),
            quarantined: state.quarantined.len(),
            ..QueueDepth::default()
        };
        for action in &state.actions {
            match action.state {
                ActionState::Pending { .. } => depth.pending += 1,
                ActionState::InFlight { .. } => depth.in_flight += 1,
                ActionState::DeadLetter { .. } => depth.dead_letter += 1,
            }
            *depth.by_type.entry(action.op.type_name()).or_insert(0) += 1;
        }
        depth
    }
}

// ============================================================================
// Tests with Failure Injection
// ============================================================================
