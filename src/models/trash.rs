use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrashEntry {
    pub id: Uuid,
    pub owner: String,
    /// Location relative to the owner's home directory.
    pub original_path: PathBuf,
    #[serde(skip)]
    pub trash_path: PathBuf,
    pub deleted_at: DateTime<Utc>,
    pub purge_after: DateTime<Utc>,
}

impl TrashEntry {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.purge_after <= now
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub purged: usize,
    pub failed: usize,
    pub bytes_freed: u64,
}
