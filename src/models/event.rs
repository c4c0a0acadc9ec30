use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Modified,
    Removed,
    Renamed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeSource {
    Api,
    Upload,
    SmbExternal,
}

/// Which slice of the data root an event touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventScope {
    User(String),
    Shared,
}

#[derive(Debug, Clone)]
pub struct FileChangeEvent {
    /// Path relative to the data root, always `/`-separated.
    pub path: String,
    pub kind: ChangeKind,
    pub source: ChangeSource,
    pub scope: EventScope,
    pub timestamp: DateTime<Utc>,
}

impl FileChangeEvent {
    pub fn new(path: impl Into<String>, kind: ChangeKind, source: ChangeSource, scope: EventScope) -> Self {
        Self {
            path: path.into(),
            kind,
            source,
            scope,
            timestamp: Utc::now(),
        }
    }

    pub fn owner(&self) -> Option<&str> {
        match &self.scope {
            EventScope::User(owner) => Some(owner),
            EventScope::Shared => None,
        }
    }
}

/// Record pushed to live clients.
#[derive(Debug, Clone, Serialize)]
pub struct NotificationRecord {
    #[serde(rename = "type")]
    pub record_type: &'static str,
    pub path: String,
    pub kind: ChangeKind,
    pub source: ChangeSource,
    pub timestamp: DateTime<Utc>,
}

impl From<&FileChangeEvent> for NotificationRecord {
    fn from(event: &FileChangeEvent) -> Self {
        Self {
            record_type: "file_change",
            path: event.path.clone(),
            kind: event.kind,
            source: event.source,
            timestamp: event.timestamp,
        }
    }
}
