// lib.rs - offline-first sync core for tasks and notes

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod cache;
pub mod codec;
pub mod config;
pub mod connectivity;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod identity;
pub mod locks;
pub mod model;
pub mod notify;
pub mod outbox;
pub mod pipeline;
pub mod reconciler;
pub mod remote;
pub mod storage;

pub use cache::{CacheError, CacheEvent, LocalCache};
pub use config::{ConfigError, ConnectivityConfig, QueueConfig, SyncConfig};
pub use connectivity::{ConnectivityEvent, ConnectivityMonitor, ConnectivityState, HealthProbe};
pub use engine::{SyncDeps, SyncEngine};
pub use error::{ErrorKind, ErrorSeverity, SyncError, SyncResult};
pub use model::{
    ActionId, CachedSnapshot, Entity, EntityId, EntityKind, EntityPatch, EntityPayload, Note,
    NotePatch, OwnerId, SyncStatus, Task, TaskPatch, TaskPriority, UnixTimeMs,
};
pub use notify::{Advisory, AdvisorySlot, Notifier, TracingNotifier};
pub use outbox::{ActionOp, OfflineAction, OfflineQueue, QueueError};
pub use pipeline::MutationPipeline;
pub use reconciler::{DrainOutcome, DrainReport, Reconciler};
pub use remote::{ErrorCategory, RemoteError, RemoteRecord, RemoteStore};
pub use storage::{LocalStorage, MemoryStorage, StorageError};

pub const MAX_TITLE_BYTES: usize = 512;
pub const MAX_CONTENT_BYTES: usize = 64 * 1024;
pub const MAX_TAGS: usize = 32;

pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_PROBE_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_SYNC_DEBOUNCE_MS: u64 = 1_500;
pub const DEFAULT_REMOTE_TIMEOUT_MS: u64 = 15_000;

pub const MAX_QUEUE_ENTRIES: usize = 10_000;
pub const MAX_RETRY_ATTEMPTS: u32 = 10;
pub const MAX_REJECTED_ATTEMPTS: u32 = 3;
pub const BASE_RETRY_DELAY_MS: u64 = 1000;
pub const MAX_RETRY_DELAY_MS: u64 = 300_000;
pub const JITTER_MAX_MS: u64 = 1000;
pub const COMPLETED_CACHE_SIZE: usize = 1024;
