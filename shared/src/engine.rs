//! Wires the sync services for one owner and runs their background loops.

use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::cache::LocalCache;
use crate::codec::SnapshotCodec;
use crate::config::SyncConfig;
use crate::connectivity::{ConnectivityMonitor, HealthProbe};
use crate::crypto::CryptoProvider;
use crate::error::SyncResult;
use crate::model::OwnerId;
use crate::notify::Notifier;
use crate::outbox::OfflineQueue;
use crate::pipeline::MutationPipeline;
use crate::reconciler::Reconciler;
use crate::remote::RemoteStore;
use crate::storage::LocalStorage;

/// Everything the engine needs from the host.
#[derive(Clone)]
pub struct SyncDeps {
    pub storage: Arc<dyn LocalStorage>,
    pub remote: Arc<dyn RemoteStore>,
    pub probe: Arc<dyn HealthProbe>,
    pub notifier: Arc<dyn Notifier>,
    /// Seals cached snapshots at rest when set.
    pub crypto: Option<Arc<dyn CryptoProvider>>,
}

pub struct SyncEngine {
    owner: OwnerId,
    cache: Arc<LocalCache>,
    queue: Arc<OfflineQueue>,
    monitor: Arc<ConnectivityMonitor>,
    pipeline: MutationPipeline,
    reconciler: Arc<Reconciler>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncEngine {
    /// Validates `config`, opens the cache and queue, and starts the probe
    /// loop and auto-sync. Connectivity starts out unknown until the host
    /// reports network presence.
    #[instrument(skip(deps, config), fields(%owner))]
    pub async fn start(owner: OwnerId, deps: SyncDeps, config: SyncConfig) -> SyncResult<Self> {
        config.validate()?;

        let codec = deps
            .crypto
            .map_or_else(SnapshotCodec::plain, SnapshotCodec::sealed);
        let cache = Arc::new(LocalCache::new(
            Arc::clone(&deps.storage),
            codec,
            Arc::clone(&deps.notifier),
        ));
        cache.init().await?;

        let queue = Arc::new(OfflineQueue::new(
            owner.clone(),
            deps.storage,
            config.queue.clone(),
        ));
        queue.init().await?;

        let monitor = Arc::new(ConnectivityMonitor::new(
            deps.probe,
            Arc::clone(&deps.notifier),
            config.connectivity.clone(),
        ));
        let kick = Arc::new(Notify::new());

        let reconciler = Arc::new(Reconciler::new(
            owner.clone(),
            Arc::clone(&cache),
            Arc::clone(&queue),
            Arc::clone(&deps.remote),
            Arc::clone(&monitor),
            Arc::clone(&deps.notifier),
            config.remote_timeout(),
            Arc::clone(&kick),
        ));
        let pipeline = MutationPipeline::new(
            owner.clone(),
            Arc::clone(&cache),
            Arc::clone(&queue),
            deps.remote,
            Arc::clone(&monitor),
            deps.notifier,
            config.remote_timeout(),
            kick,
        );

        let (shutdown, shutdown_rx) = watch::channel(false);
        let probe_loop = tokio::spawn({
            let monitor = Arc::clone(&monitor);
            let shutdown_rx = shutdown_rx.clone();
            async move { monitor.run(shutdown_rx).await }
        });
        let auto_sync = reconciler.spawn_auto_sync(shutdown_rx);

        let depth = queue.depth().await;
        info!(
            queued = depth.total,
            dead_letters = depth.dead_letter,
            "sync engine started"
        );

        Ok(Self {
            owner,
            cache,
            queue,
            monitor,
            pipeline,
            reconciler,
            shutdown,
            tasks: vec![probe_loop, auto_sync],
        })
    }

    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    pub fn pipeline(&self) -> &MutationPipeline {
        &self.pipeline
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
        &self.monitor
    }

    pub fn cache(&self) -> &Arc<LocalCache> {
        &self.cache
    }

    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }

    /// Platform network signal.
    pub async fn set_network_present(&self, present: bool) {
        self.monitor.set_network_present(present).await;
    }

    /// Stops the background loops and waits for them.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        for task in std::mem::take(&mut self.tasks) {
            if let Err(e) = task.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }
        info!(owner = %self.owner, "sync engine stopped");
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}
