use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::{MAX_CONTENT_BYTES, MAX_TAGS, MAX_TITLE_BYTES};

/// Prefix carried by every client-minted entity id.
pub const LOCAL_ID_PREFIX: &str = "local_";

// --- Typed IDs ---

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

typed_id!(OwnerId);
typed_id!(EntityId);
typed_id!(ActionId);

impl EntityId {
    /// True for ids minted on this client that the server has not confirmed yet.
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.0.starts_with(LOCAL_ID_PREFIX)
    }
}

impl ActionId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// Unix timestamp in milliseconds
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    pub fn now() -> Self {
        Self(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        )
    }

    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn add_millis(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms))
    }
}

impl fmt::Display for UnixTimeMs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Task,
    Note,
}

impl EntityKind {
    pub const ALL: [EntityKind; 2] = [EntityKind::Task, EntityKind::Note];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Note => "note",
        }
    }

    /// Remote collection name.
    #[must_use]
    pub const fn collection(self) -> &'static str {
        match self {
            Self::Task => "tasks",
            Self::Note => "notes",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "task" => Some(Self::Task),
            "note" => Some(Self::Note),
            _ => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Synced,
    #[default]
    Pending,
    Failed,
}

impl SyncStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Synced => "synced",
            Self::Pending => "pending",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "synced" => Some(Self::Synced),
            "pending" => Some(Self::Pending),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_synced(self) -> bool {
        matches!(self, Self::Synced)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("title cannot be empty")]
    EmptyTitle,

    #[error("{field} too long ({len} > {max} bytes)")]
    TooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("too many tags ({count} > {max})")]
    TooManyTags { count: usize, max: usize },

    #[error("patch for {found} cannot apply to {expected}")]
    KindMismatch {
        expected: EntityKind,
        found: EntityKind,
    },
}

fn check_len(field: &'static str, value: &str, max: usize) -> Result<(), ValidationError> {
    if value.len() > max {
        return Err(ValidationError::TooLong {
            field,
            len: value.len(),
            max,
        });
    }
    Ok(())
}

fn check_title(title: &str) -> Result<(), ValidationError> {
    if title.trim().is_empty() {
        return Err(ValidationError::EmptyTitle);
    }
    check_len("title", title, MAX_TITLE_BYTES)
}

fn check_tags(tags: &[String]) -> Result<(), ValidationError> {
    if tags.len() > MAX_TAGS {
        return Err(ValidationError::TooManyTags {
            count: tags.len(),
            max: MAX_TAGS,
        });
    }
    Ok(())
}

/// Distinguishes "field absent" (`None`) from "field explicitly cleared" (`Some(None)`).
fn double_option<'de, T, D>(de: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(de).map(Some)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub due_at: Option<UnixTimeMs>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Task {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: None,
            completed: false,
            priority: TaskPriority::Normal,
            due_at: None,
            tags: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Note {
    pub fn new(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            content: content.into(),
            pinned: false,
            tags: Vec::new(),
        }
    }
}

// Note bodies are user content; keep them out of logs.
impl fmt::Debug for Note {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Note")
            .field("title", &self.title)
            .field("content_len", &self.content.len())
            .field("pinned", &self.pinned)
            .field("tags", &self.tags)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum EntityPayload {
    Task(Task),
    Note(Note),
}

impl EntityPayload {
    #[must_use]
    pub const fn kind(&self) -> EntityKind {
        match self {
            Self::Task(_) => EntityKind::Task,
            Self::Note(_) => EntityKind::Note,
        }
    }

    #[must_use]
    pub fn title(&self) -> &str {
        match self {
            Self::Task(t) => &t.title,
            Self::Note(n) => &n.title,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Self::Task(t) => {
                check_title(&t.title)?;
                if let Some(desc) = &t.description {
                    check_len("description", desc, MAX_CONTENT_BYTES)?;
                }
                check_tags(&t.tags)
            }
            Self::Note(n) => {
                check_title(&n.title)?;
                check_len("content", &n.content, MAX_CONTENT_BYTES)?;
                check_tags(&n.tags)
            }
        }
    }

    /// Sets every field present in `patch`. Applying the same patch twice is a no-op
    /// the second time.
    pub fn apply(&mut self, patch: &EntityPatch) -> Result<(), ValidationError> {
        match (self, patch) {
            (Self::Task(task), EntityPatch::Task(p)) => {
                if let Some(title) = &p.title {
                    task.title.clone_from(title);
                }
                if let Some(description) = &p.description {
                    task.description.clone_from(description);
                }
                if let Some(completed) = p.completed {
                    task.completed = completed;
                }
                if let Some(priority) = p.priority {
                    task.priority = priority;
                }
                if let Some(due_at) = p.due_at {
                    task.due_at = due_at;
                }
                if let Some(tags) = &p.tags {
                    task.tags.clone_from(tags);
                }
                Ok(())
            }
            (Self::Note(note), EntityPatch::Note(p)) => {
                if let Some(title) = &p.title {
                    note.title.clone_from(title);
                }
                if let Some(content) = &p.content {
                    note.content.clone_from(content);
                }
                if let Some(pinned) = p.pinned {
                    note.pinned = pinned;
                }
                if let Some(tags) = &p.tags {
                    note.tags.clone_from(tags);
                }
                Ok(())
            }
            (this, patch) => Err(ValidationError::KindMismatch {
                expected: this.kind(),
                found: patch.kind(),
            }),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "double_option"
    )]
    pub description: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<TaskPriority>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "double_option"
    )]
    pub due_at: Option<Option<UnixTimeMs>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum EntityPatch {
    Task(TaskPatch),
    Note(NotePatch),
}

impl EntityPatch {
    #[must_use]
    pub const fn kind(&self) -> EntityKind {
        match self {
            Self::Task(_) => EntityKind::Task,
            Self::Note(_) => EntityKind::Note,
        }
    }

    pub fn task_title(title: impl Into<String>) -> Self {
        Self::Task(TaskPatch {
            title: Some(title.into()),
            ..TaskPatch::default()
        })
    }

    pub fn note_title(title: impl Into<String>) -> Self {
        Self::Note(NotePatch {
            title: Some(title.into()),
            ..NotePatch::default()
        })
    }
}

/// A domain record plus the bookkeeping the sync core maintains on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub owner: OwnerId,
    pub payload: EntityPayload,
    pub created_at: UnixTimeMs,
    pub updated_at: UnixTimeMs,
    pub sync_status: SyncStatus,
    pub is_local: bool,
}

impl Entity {
    #[must_use]
    pub const fn kind(&self) -> EntityKind {
        self.payload.kind()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SnapshotKey {
    pub owner: OwnerId,
    pub kind: EntityKind,
    pub id: EntityId,
}

impl fmt::Display for SnapshotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.owner, self.kind, self.id)
    }
}

/// The cache's unit of storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedSnapshot {
    pub entity: Entity,
    /// Delete requested but not yet confirmed by the remote.
    #[serde(default)]
    pub tombstone: bool,
    pub cached_at: UnixTimeMs,
}

impl CachedSnapshot {
    pub fn new(entity: Entity) -> Self {
        Self {
            entity,
            tombstone: false,
            cached_at: UnixTimeMs::now(),
        }
    }

    #[must_use]
    pub fn key(&self) -> SnapshotKey {
        SnapshotKey {
            owner: self.entity.owner.clone(),
            kind: self.entity.kind(),
            id: self.entity.id.clone(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &EntityId {
        &self.entity.id
    }

    #[must_use]
    pub const fn is_visible(&self) -> bool {
        !self.tombstone
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_prefix_marks_local_ids() {
        assert!(EntityId::new("local_123_abc").is_local());
        assert!(!EntityId::new("srv-42").is_local());
    }

    #[test]
    fn payload_validation() {
        assert!(EntityPayload::Task(Task::new("Buy milk")).validate().is_ok());
        assert_eq!(
            EntityPayload::Task(Task::new("   ")).validate(),
            Err(ValidationError::EmptyTitle)
        );

        let mut note = Note::new("n", "");
        note.tags = (0..=MAX_TAGS).map(|i| format!("t{i}")).collect();
        assert!(matches!(
            EntityPayload::Note(note).validate(),
            Err(ValidationError::TooManyTags { .. })
        ));
    }

    #[test]
    fn patch_apply_is_idempotent() {
        let mut payload = EntityPayload::Task(Task::new("draft").with_description("d"));
        let patch = EntityPatch::Task(TaskPatch {
            title: Some("final".into()),
            description: Some(None),
            completed: Some(true),
            ..TaskPatch::default()
        });

        payload.apply(&patch).unwrap();
        let once = payload.clone();
        payload.apply(&patch).unwrap();

        assert_eq!(payload, once);
        let EntityPayload::Task(task) = payload else {
            panic!("expected task");
        };
        assert_eq!(task.title, "final");
        assert_eq!(task.description, None);
        assert!(task.completed);
    }

    #[test]
    fn patch_kind_mismatch_rejected() {
        let mut payload = EntityPayload::Note(Note::new("n", "body"));
        let err = payload.apply(&EntityPatch::task_title("x")).unwrap_err();
        assert_eq!(
            err,
            ValidationError::KindMismatch {
                expected: EntityKind::Note,
                found: EntityKind::Task,
            }
        );
    }

    #[test]
    fn cleared_field_survives_json() {
        let patch = EntityPatch::Task(TaskPatch {
            description: Some(None),
            ..TaskPatch::default()
        });
        let json = serde_json::to_string(&patch).unwrap();
        let back: EntityPatch = serde_json::from_str(&json).unwrap();
        assert_eq!(back, patch);

        let untouched: EntityPatch =
            serde_json::from_str(r#"{"kind":"task","data":{"title":"t"}}"#).unwrap();
        let EntityPatch::Task(p) = untouched else {
            panic!("expected task patch");
        };
        assert_eq!(p.description, None);
    }

    #[test]
    fn note_debug_redacts_content() {
        let note = Note::new("title", "very private body");
        let out = format!("{note:?}");
        assert!(!out.contains("private"));
        assert!(out.contains("content_len"));
    }
}
