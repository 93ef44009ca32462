use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::{info, warn};

use crate::model::{EntityId, EntityKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ToastKind {
    #[default]
    Info,
    Success,
    Warning,
    Error,
}

impl ToastKind {
    #[must_use]
    pub const fn default_duration_ms(self) -> u64 {
        match self {
            Self::Info => 3000,
            Self::Success => 2000,
            Self::Warning => 4000,
            Self::Error => 5000,
        }
    }
}

/// Stable handle for advisories the host may need to dismiss later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvisorySlot {
    Connectivity,
    Sync,
    Storage,
}

/// Something the user should see. Rendering is the host's business.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Advisory {
    Offline,
    BackOnline { pending: usize },
    SavedOffline { kind: EntityKind, id: EntityId },
    SyncSummary { synced: usize, failed: usize, total: usize },
    StorageUnavailable { message: String, retryable: bool },
    LocalWriteFailed { kind: EntityKind, message: String },
}

impl Advisory {
    #[must_use]
    pub const fn slot(&self) -> AdvisorySlot {
        match self {
            Self::Offline | Self::BackOnline { .. } => AdvisorySlot::Connectivity,
            Self::SavedOffline { .. } | Self::SyncSummary { .. } => AdvisorySlot::Sync,
            Self::StorageUnavailable { .. } | Self::LocalWriteFailed { .. } => {
                AdvisorySlot::Storage
            }
        }
    }

    #[must_use]
    pub const fn toast_kind(&self) -> ToastKind {
        match self {
            Self::Offline => ToastKind::Warning,
            Self::BackOnline { .. } | Self::SavedOffline { .. } => ToastKind::Info,
            Self::SyncSummary { failed: 0, .. } => ToastKind::Success,
            Self::SyncSummary { .. } => ToastKind::Warning,
            Self::StorageUnavailable { .. } | Self::LocalWriteFailed { .. } => ToastKind::Error,
        }
    }

    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::Offline => "You are offline. Changes are saved on this device.".into(),
            Self::BackOnline { pending: 0 } => "Back online.".into(),
            Self::BackOnline { pending } => format!("Back online. Syncing {pending} change(s)..."),
            Self::SavedOffline { kind, .. } => format!("{kind} saved offline"),
            Self::SyncSummary {
                synced,
                failed: 0,
                total,
            } => format!("{synced} of {total} synced"),
            Self::SyncSummary {
                synced,
                failed,
                total,
            } => format!("{synced} of {total} synced, {failed} failed, will retry"),
            Self::StorageUnavailable { message, .. } => message.clone(),
            Self::LocalWriteFailed { message, .. } => message.clone(),
        }
    }
}

pub trait Notifier: Send + Sync {
    fn show(&self, advisory: Advisory);
    fn dismiss(&self, slot: AdvisorySlot);
}

/// Default notifier for hosts without a UI hook: advisories go to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn show(&self, advisory: Advisory) {
        match advisory.toast_kind() {
            ToastKind::Warning | ToastKind::Error => {
                warn!(slot = ?advisory.slot(), "{}", advisory.message())
            }
            ToastKind::Info | ToastKind::Success => {
                info!(slot = ?advisory.slot(), "{}", advisory.message())
            }
        }
    }

    fn dismiss(&self, slot: AdvisorySlot) {
        info!(?slot, "advisory dismissed");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoticeEvent {
    Shown(Advisory),
    Dismissed(AdvisorySlot),
}

/// Records every call; used by tests and by hosts that poll.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<NoticeEvent>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<NoticeEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn shown(&self) -> Vec<Advisory> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                NoticeEvent::Shown(a) => Some(a),
                NoticeEvent::Dismissed(_) => None,
            })
            .collect()
    }

    pub fn count_shown(&self, pred: impl Fn(&Advisory) -> bool) -> usize {
        self.shown().iter().filter(|a| pred(a)).count()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }

    fn push(&self, event: NoticeEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

impl Notifier for RecordingNotifier {
    fn show(&self, advisory: Advisory) {
        self.push(NoticeEvent::Shown(advisory));
    }

    fn dismiss(&self, slot: AdvisorySlot) {
        self.push(NoticeEvent::Dismissed(slot));
    }
}
