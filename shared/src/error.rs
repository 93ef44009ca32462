use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::CacheError;
use crate::config::ConfigError;
use crate::model::{EntityId, EntityKind, ValidationError};
use crate::outbox::QueueError;
use crate::remote::{ErrorCategory, RemoteError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Transient,
    Permanent,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Network,
    Timeout,
    RateLimited,
    Server,
    Rejected,
    NotFound,
    Validation,
    Storage,
    StorageUnavailable,
    Serialization,
    Integrity,
    Crypto,
    QueueFull,
    InvalidState,
    Config,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Network => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::RateLimited => "RATE_LIMITED",
            Self::Server => "SERVER_ERROR",
            Self::Rejected => "REJECTED",
            Self::NotFound => "NOT_FOUND",
            Self::Validation => "VALIDATION_ERROR",
            Self::Storage => "STORAGE_ERROR",
            Self::StorageUnavailable => "STORAGE_UNAVAILABLE",
            Self::Serialization => "SERIALIZATION_ERROR",
            Self::Integrity => "INTEGRITY_ERROR",
            Self::Crypto => "CRYPTO_ERROR",
            Self::QueueFull => "QUEUE_FULL",
            Self::InvalidState => "INVALID_STATE",
            Self::Config => "CONFIG_ERROR",
        }
    }

    #[must_use]
    pub const fn default_severity(self) -> ErrorSeverity {
        match self {
            Self::Network | Self::Timeout | Self::RateLimited | Self::Server => {
                ErrorSeverity::Transient
            }

            Self::Storage
            | Self::StorageUnavailable
            | Self::Serialization
            | Self::Integrity
            | Self::Crypto
            | Self::InvalidState
            | Self::Config => ErrorSeverity::Fatal,

            Self::Rejected | Self::NotFound | Self::Validation | Self::QueueFull => {
                ErrorSeverity::Permanent
            }
        }
    }

    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Network | Self::Timeout | Self::RateLimited | Self::Server
        )
    }
}

/// Errors surfaced by the sync core's public operations.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("local cache: {0}")]
    Cache(#[from] CacheError),

    #[error("offline queue: {0}")]
    Queue(#[from] QueueError),

    #[error("remote: {0}")]
    Remote(#[from] RemoteError),

    #[error("invalid entity: {0}")]
    Validation(#[from] ValidationError),

    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: EntityId },

    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
}

impl SyncError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Cache(CacheError::InitFailed(_)) => ErrorKind::StorageUnavailable,
            Self::Cache(CacheError::Storage(_)) => ErrorKind::Storage,
            Self::Cache(CacheError::Codec(e)) => {
                if e.is_crypto_failure() {
                    ErrorKind::Crypto
                } else if e.is_integrity_failure() {
                    ErrorKind::Integrity
                } else {
                    ErrorKind::Serialization
                }
            }
            Self::Cache(CacheError::Misfiled { .. }) => ErrorKind::InvalidState,
            Self::Queue(QueueError::Full(_)) => ErrorKind::QueueFull,
            Self::Queue(QueueError::NotFound(_)) => ErrorKind::NotFound,
            Self::Queue(QueueError::Storage(_)) => ErrorKind::Storage,
            Self::Queue(QueueError::Duplicate(_)) => ErrorKind::InvalidState,
            Self::Queue(QueueError::Encode(_)) => ErrorKind::Serialization,
            Self::Remote(e) => match e.category {
                ErrorCategory::Network => ErrorKind::Network,
                ErrorCategory::Timeout => ErrorKind::Timeout,
                ErrorCategory::RateLimited => ErrorKind::RateLimited,
                ErrorCategory::ServerError => ErrorKind::Server,
                ErrorCategory::NotFound => ErrorKind::NotFound,
                ErrorCategory::Rejected => ErrorKind::Rejected,
            },
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    #[must_use]
    pub fn severity(&self) -> ErrorSeverity {
        self.kind().default_severity()
    }

    #[must_use]
    pub fn code(&self) -> &'static str {
        self.kind().code()
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Local persistence failed; the optimistic change was not kept.
    #[must_use]
    pub fn is_local_storage_failure(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Storage
                | ErrorKind::StorageUnavailable
                | ErrorKind::Serialization
                | ErrorKind::Integrity
                | ErrorKind::QueueFull
        )
    }

    #[must_use]
    pub fn user_facing_message(&self) -> String {
        match self.kind() {
            ErrorKind::Network
            | ErrorKind::Timeout
            | ErrorKind::RateLimited
            | ErrorKind::Server => {
                "Saved on this device. It will sync when the connection is back.".into()
            }
            ErrorKind::Rejected => "The server refused this change.".into(),
            ErrorKind::NotFound => "The item could not be found.".into(),
            ErrorKind::Validation => self.to_string(),
            ErrorKind::Storage | ErrorKind::Serialization | ErrorKind::Integrity => {
                "Unable to save on this device. Your change was not kept; please try again.".into()
            }
            ErrorKind::StorageUnavailable => {
                "Local storage is unavailable. Retry, or reload the app.".into()
            }
            ErrorKind::QueueFull => {
                "Too many changes are waiting to sync. Reconnect before making more.".into()
            }
            ErrorKind::Crypto => "A security error occurred. Please sign in again.".into(),
            ErrorKind::InvalidState | ErrorKind::Config => {
                "An unexpected error occurred. Please restart the app.".into()
            }
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
