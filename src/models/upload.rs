use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{collections::HashMap, net::IpAddr, path::PathBuf};
use uuid::Uuid;

use crate::errors::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Created,
    Receiving,
    Paused,
    Completed,
    Terminated,
    Failed,
}

impl UploadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UploadStatus::Completed | UploadStatus::Terminated | UploadStatus::Failed
        )
    }
}

/// Decoded `Upload-Metadata` header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadMetadata {
    pub filename: Option<String>,
    pub path: Option<String>,
    pub username: Option<String>,
    pub overwrite: bool,
    pub extra: HashMap<String, String>,
}

impl UploadMetadata {
    /// Parses `key base64value` pairs separated by commas. A key without a value
    /// decodes to an empty string.
    pub fn parse(header: &str) -> Result<Self> {
        let mut metadata = UploadMetadata::default();

        for pair in header.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let mut parts = pair.splitn(2, ' ');
            let key = parts.next().unwrap_or_default().trim();
            if key.is_empty() {
                return Err(AppError::Validation("empty Upload-Metadata key".to_string()));
            }

            let value = match parts.next().map(str::trim) {
                Some(encoded) if !encoded.is_empty() => {
                    let bytes = general_purpose::STANDARD.decode(encoded).map_err(|_| {
                        AppError::Validation(format!("invalid base64 in Upload-Metadata key {}", key))
                    })?;
                    String::from_utf8(bytes).map_err(|_| {
                        AppError::Validation(format!("non UTF-8 Upload-Metadata value for {}", key))
                    })?
                }
                _ => String::new(),
            };

            match key {
                "filename" => metadata.filename = Some(value),
                "path" => metadata.path = Some(value),
                "username" => metadata.username = Some(value),
                "overwrite" => metadata.overwrite = value.eq_ignore_ascii_case("true") || value == "1",
                _ => {
                    metadata.extra.insert(key.to_string(), value);
                }
            }
        }

        Ok(metadata)
    }

    /// Target path relative to the owner's home: `path` is the destination
    /// directory when a `filename` is also given.
    pub fn target_path(&self) -> Option<String> {
        let filename = self.filename.as_deref().filter(|f| !f.is_empty());
        let path = self.path.as_deref().filter(|p| !p.is_empty());

        match (path, filename) {
            (Some(dir), Some(name)) => Some(format!("{}/{}", dir.trim_end_matches('/'), name)),
            (Some(full), None) => Some(full.to_string()),
            (None, Some(name)) => Some(name.to_string()),
            (None, None) => None,
        }
    }

    /// Flattened form kept on the session.
    pub fn into_map(self) -> HashMap<String, String> {
        let mut map = self.extra;
        if let Some(filename) = self.filename {
            map.insert("filename".to_string(), filename);
        }
        if let Some(path) = self.path {
            map.insert("path".to_string(), path);
        }
        if let Some(username) = self.username {
            map.insert("username".to_string(), username);
        }
        map.insert("overwrite".to_string(), self.overwrite.to_string());
        map
    }
}

/// Arguments to create a resumable upload.
#[derive(Debug, Clone)]
pub struct NewUpload {
    pub owner: String,
    pub target_path: String,
    pub declared_length: u64,
    pub metadata: UploadMetadata,
    pub client_addr: Option<IpAddr>,
}

#[derive(Debug, Clone)]
pub struct UploadSession {
    pub id: Uuid,
    pub owner: String,
    /// Destination relative to the owner's home directory.
    pub target_path: PathBuf,
    pub declared_length: u64,
    pub bytes_received: u64,
    pub status: UploadStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub client_addr: Option<IpAddr>,
    pub metadata: HashMap<String, String>,
    pub overwrite: bool,
    pub reservation_id: Uuid,
}

impl UploadSession {
    pub fn is_complete(&self) -> bool {
        self.bytes_received == self.declared_length
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadInfo {
    pub id: Uuid,
    pub target_path: String,
    pub offset: u64,
    pub length: u64,
    pub status: UploadStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl From<&UploadSession> for UploadInfo {
    fn from(session: &UploadSession) -> Self {
        Self {
            id: session.id,
            target_path: session.target_path.to_string_lossy().into_owned(),
            offset: session.bytes_received,
            length: session.declared_length,
            status: session.status,
            created_at: session.created_at,
            last_activity: session.last_activity,
        }
    }
}
