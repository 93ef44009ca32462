use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use crate::config::ConnectivityConfig;
use crate::model::UnixTimeMs;
use crate::notify::{Advisory, AdvisorySlot, Notifier};
use crate::remote::RemoteError;

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityState {
    pub is_online: bool,
    pub is_server_reachable: bool,
    pub last_offline_time: Option<UnixTimeMs>,
}

impl ConnectivityState {
    #[must_use]
    pub const fn is_fully_online(&self) -> bool {
        self.is_online && self.is_server_reachable
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectivityEvent {
    BecameOffline,
    BecameOnline,
    /// Emitted after every completed probe.
    Probed { reachable: bool },
}

/// Side-effect-free reachability check. `Ok` means the server answered 2xx.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self) -> Result<(), RemoteError>;
}

/// Owns the connectivity state. Nothing else writes it.
pub struct ConnectivityMonitor {
    state: watch::Sender<ConnectivityState>,
    events: broadcast::Sender<ConnectivityEvent>,
    probe: Arc<dyn HealthProbe>,
    notifier: Arc<dyn Notifier>,
    config: ConnectivityConfig,
    offline_advisory_shown: AtomicBool,
    probe_gate: Mutex<()>,
    running: AtomicBool,
}

impl ConnectivityMonitor {
    pub fn new(
        probe: Arc<dyn HealthProbe>,
        notifier: Arc<dyn Notifier>,
        config: ConnectivityConfig,
    ) -> Self {
        let (state, _) = watch::channel(ConnectivityState::default());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state,
            events,
            probe,
            notifier,
            config,
            offline_advisory_shown: AtomicBool::new(false),
            probe_gate: Mutex::new(()),
            running: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> ConnectivityState {
        *self.state.borrow()
    }

    pub fn is_fully_online(&self) -> bool {
        self.state().is_fully_online()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.events.subscribe()
    }

    pub fn watch(&self) -> watch::Receiver<ConnectivityState> {
        self.state.subscribe()
    }

    pub fn config(&self) -> &ConnectivityConfig {
        &self.config
    }

    /// Platform network signal. Going online re-probes immediately.
    #[instrument(skip(self))]
    pub async fn set_network_present(&self, present: bool) {
        let (before, after) = self.update(|s| {
            if !present {
                if s.is_online {
                    s.last_offline_time = Some(UnixTimeMs::now());
                }
                s.is_server_reachable = false;
            }
            s.is_online = present;
        });

        if before.is_online != after.is_online {
            info!(online = present, "network presence changed");
        }
        // Online-but-unverified is not a confirmed outage yet.
        self.on_transition(before, after, !present);

        if present && !before.is_online {
            self.check_reachability().await;
        }
    }

    /// Probes the server with a bounded timeout. Skipped while the network is absent.
    #[instrument(skip(self))]
    pub async fn check_reachability(&self) -> bool {
        if !self.state().is_online {
            debug!("network absent, probe skipped");
            return false;
        }

        let _gate = self.probe_gate.lock().await;
        let reachable = match tokio::time::timeout(self.config.probe_timeout(), self.probe.probe())
            .await
        {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!(error = %e, "health probe failed");
                false
            }
            Err(_) => {
                debug!(timeout_ms = self.config.probe_timeout_ms, "health probe timed out");
                false
            }
        };

        let (before, after) = self.update(|s| {
            // The network may have dropped while the probe was in flight.
            if !s.is_online {
                return;
            }
            if s.is_fully_online() && !reachable {
                s.last_offline_time = Some(UnixTimeMs::now());
            }
            s.is_server_reachable = reachable;
        });

        self.on_transition(before, after, after.is_online && !reachable);
        let _ = self.events.send(ConnectivityEvent::Probed { reachable });
        after.is_fully_online()
    }

    /// Periodic probe loop. Returns when `shutdown` flips to true or its sender drops.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("connectivity monitor already running, ignoring duplicate start");
            return;
        }

        let mut ticker = tokio::time::interval(self.config.probe_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; startup probing is driven by set_network_present.
        ticker.tick().await;

        info!(interval_ms = self.config.probe_interval_ms, "connectivity monitor started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.state().is_online {
                        self.check_reachability().await;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!("connectivity monitor stopped");
    }

    fn update(
        &self,
        f: impl FnOnce(&mut ConnectivityState),
    ) -> (ConnectivityState, ConnectivityState) {
        let mut before = ConnectivityState::default();
        let mut after = before;
        self.state.send_if_modified(|s| {
            before = *s;
            f(s);
            after = *s;
            before != after
        });
        (before, after)
    }

    fn on_transition(
        &self,
        before: ConnectivityState,
        after: ConnectivityState,
        confirmed_down: bool,
    ) {
        match (before.is_fully_online(), after.is_fully_online()) {
            (false, true) => {
                info!("fully online");
                if self.offline_advisory_shown.swap(false, Ordering::SeqCst) {
                    self.notifier.dismiss(AdvisorySlot::Connectivity);
                }
                let _ = self.events.send(ConnectivityEvent::BecameOnline);
            }
            (true, false) => {
                warn!(
                    online = after.is_online,
                    reachable = after.is_server_reachable,
                    "lost connectivity"
                );
                let _ = self.events.send(ConnectivityEvent::BecameOffline);
                self.show_offline_once();
            }
            (false, false) if confirmed_down => self.show_offline_once(),
            _ => {}
        }
    }

    fn show_offline_once(&self) {
        if !self.offline_advisory_shown.swap(true, Ordering::SeqCst) {
            self.notifier.show(Advisory::Offline);
        }
    }
}
