use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Authoritative per-user storage figures as persisted in `user_storage`.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserStorage {
    pub username: String,
    pub quota_bytes: i64,
    pub used_bytes: i64,
}

impl UserStorage {
    pub fn new(username: impl Into<String>, quota_bytes: i64) -> Self {
        Self {
            username: username.into(),
            quota_bytes,
            used_bytes: 0,
        }
    }

    pub fn quota(&self) -> u64 {
        self.quota_bytes.max(0) as u64
    }

    pub fn used(&self) -> u64 {
        self.used_bytes.max(0) as u64
    }
}
