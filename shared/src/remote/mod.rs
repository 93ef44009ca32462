//! The authoritative document store, seen from the client.

#[cfg(feature = "http")]
mod http;

#[cfg(feature = "http")]
pub use self::http::{HttpHealthProbe, HttpRemoteStore};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;

use crate::model::{EntityId, EntityKind, EntityPatch, EntityPayload, OwnerId, UnixTimeMs};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    Network,
    Timeout,
    RateLimited,
    ServerError,
    NotFound,
    Rejected,
}

impl ErrorCategory {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCategory::Network
                | ErrorCategory::Timeout
                | ErrorCategory::RateLimited
                | ErrorCategory::ServerError
        )
    }

    /// Classifies a non-success HTTP status.
    pub fn from_status(status: u16) -> Self {
        match status {
            408 => ErrorCategory::Timeout,
            429 => ErrorCategory::RateLimited,
            404 => ErrorCategory::NotFound,
            400..=499 => ErrorCategory::Rejected,
            _ => ErrorCategory::ServerError,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "network",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::RateLimited => "rate_limited",
            ErrorCategory::ServerError => "server_error",
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::Rejected => "rejected",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub category: ErrorCategory,
    pub message: String,
    pub status: Option<u16>,
}

impl RemoteError {
    const MAX_MESSAGE_LENGTH: usize = 512;

    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        let mut message = message.into();
        truncate_utf8_safe(&mut message, Self::MAX_MESSAGE_LENGTH);
        Self {
            category,
            message,
            status: None,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Timeout, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Rejected, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::NotFound, message)
    }

    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            ..Self::new(ErrorCategory::from_status(status), message)
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.category.is_retryable()
    }

    pub fn is_not_found(&self) -> bool {
        self.category == ErrorCategory::NotFound
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} ({status}): {}", self.category.as_str(), self.message),
            None => write!(f, "{}: {}", self.category.as_str(), self.message),
        }
    }
}

impl std::error::Error for RemoteError {}

fn truncate_utf8_safe(s: &mut String, max_bytes: usize) {
    if s.len() <= max_bytes {
        return;
    }
    let mut cut = max_bytes;
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
}

/// A server-side copy as returned by `list_all`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub id: EntityId,
    pub owner: OwnerId,
    pub payload: EntityPayload,
    pub updated_at: UnixTimeMs,
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Returns the server-issued id.
    async fn create(
        &self,
        owner: &OwnerId,
        payload: &EntityPayload,
    ) -> Result<EntityId, RemoteError>;

    async fn update(
        &self,
        kind: EntityKind,
        id: &EntityId,
        patch: &EntityPatch,
    ) -> Result<(), RemoteError>;

    async fn delete(&self, kind: EntityKind, id: &EntityId) -> Result<(), RemoteError>;

    async fn list_all(
        &self,
        kind: EntityKind,
        owner: &OwnerId,
    ) -> Result<Vec<RemoteRecord>, RemoteError>;
}

/// Bounds a remote call. Running out of time is a retryable `Timeout`.
pub async fn with_timeout<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, RemoteError>>,
) -> Result<T, RemoteError> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(RemoteError::timeout(format!(
            "no response within {} ms",
            limit.as_millis()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(ErrorCategory::from_status(408), ErrorCategory::Timeout);
        assert_eq!(ErrorCategory::from_status(429), ErrorCategory::RateLimited);
        assert_eq!(ErrorCategory::from_status(503), ErrorCategory::ServerError);
        assert_eq!(ErrorCategory::from_status(404), ErrorCategory::NotFound);
        assert_eq!(ErrorCategory::from_status(422), ErrorCategory::Rejected);
        assert_eq!(ErrorCategory::from_status(401), ErrorCategory::Rejected);
    }

    #[test]
    fn only_transient_categories_retry() {
        assert!(RemoteError::network("reset").is_retryable());
        assert!(RemoteError::from_status(500, "boom").is_retryable());
        assert!(!RemoteError::from_status(400, "bad").is_retryable());
        assert!(!RemoteError::not_found("gone").is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_calls_time_out_as_retryable() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, RemoteError>(())
        };
        let err = with_timeout(Duration::from_secs(15), slow).await.unwrap_err();
        assert_eq!(err.category, ErrorCategory::Timeout);
        assert!(err.is_retryable());
    }

    #[test]
    fn long_messages_truncate_on_char_boundary() {
        let err = RemoteError::rejected("日本語".repeat(300));
        assert!(err.message.len() <= RemoteError::MAX_MESSAGE_LENGTH);
        assert!(err.message.is_char_boundary(err.message.len()));
        assert_eq!(
            RemoteError::from_status(429, "slow down").to_string(),
            "rate_limited (429): slow down"
        );
    }
}
