use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::{database::UsageStore, errors::Result, models::UserStorage};

/// In-process usage store for tests and single-node development setups.
#[derive(Default)]
pub struct MemoryUsageStore {
    users: RwLock<HashMap<String, UserStorage>>,
}

impl MemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(self, username: &str, quota_bytes: i64) -> Self {
        self.set_quota(username, quota_bytes);
        self
    }

    pub fn set_quota(&self, username: &str, quota_bytes: i64) {
        self.users
            .write()
            .entry(username.to_string())
            .and_modify(|u| u.quota_bytes = quota_bytes)
            .or_insert_with(|| UserStorage::new(username, quota_bytes));
    }

    pub fn used_bytes(&self, username: &str) -> Option<i64> {
        self.users.read().get(username).map(|u| u.used_bytes)
    }
}

#[async_trait]
impl UsageStore for MemoryUsageStore {
    async fn get_usage(&self, username: &str) -> Result<Option<UserStorage>> {
        Ok(self.users.read().get(username).cloned())
    }

    async fn add_used_bytes(&self, username: &str, delta: i64) -> Result<()> {
        if let Some(user) = self.users.write().get_mut(username) {
            user.used_bytes = (user.used_bytes + delta).max(0);
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
