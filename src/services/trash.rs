use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    errors::{AppError, Result},
    models::{ChangeKind, ChangeSource, EventScope, FileChangeEvent, SweepReport, TrashEntry},
    services::{
        admission::AdmissionController, metrics::MetricsService, notifications::NotificationHub,
        usage_cache::UsageCache, watcher::OwnWrites,
    },
    storage::{self, DataLayout, Placement, HOME_DIR},
    utils::to_slash_path,
};

/// Soft delete, restore and retention-based purge of user files.
pub struct TrashManager {
    layout: DataLayout,
    cache: Arc<UsageCache>,
    hub: Arc<NotificationHub>,
    admission: Arc<AdmissionController>,
    metrics: Arc<MetricsService>,
    own_writes: Arc<OwnWrites>,
    retention: Duration,
    entries: RwLock<HashMap<Uuid, TrashEntry>>,
    // moves in and out of the trash are serialized
    ops: AsyncMutex<()>,
}

impl TrashManager {
    pub fn new(
        layout: DataLayout,
        cache: Arc<UsageCache>,
        hub: Arc<NotificationHub>,
        admission: Arc<AdmissionController>,
        metrics: Arc<MetricsService>,
        own_writes: Arc<OwnWrites>,
        retention: Duration,
    ) -> Self {
        Self {
            layout,
            cache,
            hub,
            admission,
            metrics,
            own_writes,
            retention,
            entries: RwLock::new(HashMap::new()),
            ops: AsyncMutex::new(()),
        }
    }

    pub async fn soft_delete(&self, owner: &str, raw_path: &str) -> Result<TrashEntry> {
        let (relative, source) = self.layout.resolve_home_path(owner, raw_path)?;
        let _guard = self.ops.lock().await;

        if !storage::path_exists(&source).await {
            return Err(AppError::NotFound);
        }

        let id = Uuid::new_v4();
        let entry_dir = self.layout.trash_dir(owner).join(id.to_string());
        let trash_path = entry_dir.join(&relative);
        self.own_writes.register(source.clone());
        self.own_writes.register(entry_dir);
        storage::move_item(&source, &trash_path).await?;

        let deleted_at = Utc::now();
        let entry = TrashEntry {
            id,
            owner: owner.to_string(),
            original_path: relative,
            trash_path,
            deleted_at,
            purge_after: deleted_at + retention_as_chrono(self.retention),
        };
        self.entries.write().insert(id, entry.clone());

        self.cache.invalidate_user(owner);
        self.publish(&entry, ChangeKind::Removed);
        info!(entry = %id, owner, path = %entry.original_path.display(), "moved to trash");

        Ok(entry)
    }

    pub async fn restore(&self, id: Uuid) -> Result<TrashEntry> {
        let _guard = self.ops.lock().await;
        let entry = self.get(id).ok_or(AppError::EntryNotFound)?;

        let destination = self.layout.home_dir(&entry.owner).join(&entry.original_path);
        self.own_writes.register(destination.clone());
        self.own_writes.register(self.entry_dir(&entry));
        if storage::move_new(&entry.trash_path, &destination).await? == Placement::Occupied {
            return Err(AppError::TrashConflict(to_slash_path(&entry.original_path)));
        }

        self.entries.write().remove(&id);
        if let Err(e) = storage::remove_tree(&self.entry_dir(&entry)).await {
            warn!(entry = %id, error = %e, "failed to clean up trash directory");
        }

        self.cache.invalidate_user(&entry.owner);
        self.publish(&entry, ChangeKind::Created);
        info!(entry = %id, owner = %entry.owner, "restored from trash");

        Ok(entry)
    }

    pub fn get(&self, id: Uuid) -> Option<TrashEntry> {
        self.entries.read().get(&id).cloned()
    }

    /// Newest first.
    pub fn list(&self, owner: &str) -> Vec<TrashEntry> {
        let mut entries: Vec<TrashEntry> = self
            .entries
            .read()
            .values()
            .filter(|entry| entry.owner == owner)
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.deleted_at.cmp(&a.deleted_at));
        entries
    }

    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(Utc::now()).await
    }

    /// Permanently deletes entries whose deadline is at or before `now`.
    /// A failed entry stays in the index for the next run.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let _guard = self.ops.lock().await;
        let due: Vec<TrashEntry> = self
            .entries
            .read()
            .values()
            .filter(|entry| entry.is_due(now))
            .cloned()
            .collect();

        let mut report = SweepReport::default();
        for entry in due {
            let dir = self.entry_dir(&entry);
            let bytes = storage::tree_size(&dir).await.unwrap_or(0);
            self.own_writes.register(dir.clone());

            if let Err(e) = storage::remove_tree(&dir).await {
                error!(entry = %entry.id, error = %e, "failed to purge trash entry");
                report.failed += 1;
                continue;
            }

            self.entries.write().remove(&entry.id);
            if let Err(e) = self.admission.credit(&entry.owner, bytes).await {
                warn!(entry = %entry.id, error = %e, "failed to credit purged bytes");
            }
            self.cache.invalidate_user(&entry.owner);

            report.purged += 1;
            report.bytes_freed += bytes;
        }

        if report.purged > 0 || report.failed > 0 {
            self.metrics.record_trash_purged(report.purged as u64);
            info!(
                purged = report.purged,
                failed = report.failed,
                bytes = report.bytes_freed,
                "trash sweep finished"
            );
        }
        report
    }

    fn entry_dir(&self, entry: &TrashEntry) -> PathBuf {
        self.layout.trash_dir(&entry.owner).join(entry.id.to_string())
    }

    fn publish(&self, entry: &TrashEntry, kind: ChangeKind) {
        let path = PathBuf::from(HOME_DIR)
            .join(&entry.owner)
            .join(&entry.original_path);
        self.hub.publish(FileChangeEvent::new(
            to_slash_path(&path),
            kind,
            ChangeSource::Api,
            EventScope::User(entry.owner.clone()),
        ));
    }
}

fn retention_as_chrono(retention: Duration) -> chrono::Duration {
    chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::days(36500))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        database::{MemoryUsageStore, UsageStore},
        services::notifications::SubscriptionFilter,
        storage::FsTreeSizer,
    };

    struct Fixture {
        _temp_dir: tempfile::TempDir,
        layout: DataLayout,
        store: Arc<MemoryUsageStore>,
        hub: Arc<NotificationHub>,
        trash: TrashManager,
    }

    fn fixture() -> Fixture {
        let temp_dir = tempfile::tempdir().unwrap();
        let layout = DataLayout::new(temp_dir.path());
        let store = Arc::new(MemoryUsageStore::new().with_user("alice", 10_000));
        let metrics = Arc::new(MetricsService::new().unwrap());
        let cache = Arc::new(UsageCache::new(
            layout.clone(),
            store.clone(),
            Arc::new(FsTreeSizer),
            metrics.clone(),
            Duration::from_secs(60),
        ));
        let admission = Arc::new(AdmissionController::new(store.clone(), cache.clone()));
        let hub = Arc::new(NotificationHub::new(16, metrics.clone()));
        let trash = TrashManager::new(
            layout.clone(),
            cache,
            hub.clone(),
            admission,
            metrics,
            Arc::new(OwnWrites::new(Duration::from_secs(5))),
            Duration::from_secs(30 * 86400),
        );

        Fixture {
            _temp_dir: temp_dir,
            layout,
            store,
            hub,
            trash,
        }
    }

    fn write_home_file(layout: &DataLayout, relative: &str, size: usize) {
        let path = layout.home_dir("alice").join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, vec![7u8; size]).unwrap();
    }

    #[tokio::test]
    async fn test_soft_delete_moves_into_trash() {
        let f = fixture();
        write_home_file(&f.layout, "docs/a.txt", 100);
        let mut events = f.hub.subscribe(SubscriptionFilter::for_user("alice"));

        let entry = f.trash.soft_delete("alice", "/docs/a.txt").await.unwrap();
        assert!(!f.layout.home_dir("alice").join("docs/a.txt").exists());
        assert!(f
            .layout
            .trash_dir("alice")
            .join(entry.id.to_string())
            .join("docs/a.txt")
            .exists());
        assert_eq!(entry.purge_after - entry.deleted_at, chrono::Duration::days(30));

        let event = events.receiver.recv().await.unwrap();
        assert_eq!(event.kind, ChangeKind::Removed);
        assert_eq!(event.path, "home/alice/docs/a.txt");

        assert!(matches!(
            f.trash.soft_delete("alice", "docs/a.txt").await,
            Err(AppError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_retention_sweep() {
        let f = fixture();
        write_home_file(&f.layout, "a.txt", 400);
        f.store.add_used_bytes("alice", 400).await.unwrap();
        let entry = f.trash.soft_delete("alice", "a.txt").await.unwrap();

        let early = f.trash.sweep_at(entry.purge_after - chrono::Duration::seconds(1)).await;
        assert_eq!(early, SweepReport::default());
        assert!(f.trash.get(entry.id).is_some());

        let report = f.trash.sweep_at(entry.purge_after).await;
        assert_eq!(report.purged, 1);
        assert_eq!(report.bytes_freed, 400);
        assert!(!entry.trash_path.exists());
        assert_eq!(f.store.used_bytes("alice"), Some(0));

        assert!(matches!(
            f.trash.restore(entry.id).await,
            Err(AppError::EntryNotFound)
        ));
    }

    #[tokio::test]
    async fn test_restore_round_trip() {
        let f = fixture();
        write_home_file(&f.layout, "photos/cat.jpg", 10);
        let entry = f.trash.soft_delete("alice", "photos/cat.jpg").await.unwrap();

        let restored = f.trash.restore(entry.id).await.unwrap();
        assert_eq!(restored.id, entry.id);
        assert!(f.layout.home_dir("alice").join("photos/cat.jpg").exists());
        assert!(!f.layout.trash_dir("alice").join(entry.id.to_string()).exists());
        assert!(f.trash.list("alice").is_empty());
    }

    #[tokio::test]
    async fn test_restore_into_occupied_path_conflicts() {
        let f = fixture();
        write_home_file(&f.layout, "a.txt", 10);
        let entry = f.trash.soft_delete("alice", "a.txt").await.unwrap();
        write_home_file(&f.layout, "a.txt", 20);

        assert!(matches!(
            f.trash.restore(entry.id).await,
            Err(AppError::TrashConflict(_))
        ));
        assert!(entry.trash_path.exists());
        assert!(f.trash.get(entry.id).is_some());
        assert_eq!(
            std::fs::read(f.layout.home_dir("alice").join("a.txt")).unwrap(),
            vec![7u8; 20]
        );
    }

    #[tokio::test]
    async fn test_restore_directory_keeps_occupied_target() {
        let f = fixture();
        write_home_file(&f.layout, "album/1.jpg", 10);
        let entry = f.trash.soft_delete("alice", "album").await.unwrap();
        write_home_file(&f.layout, "album/other.jpg", 5);

        assert!(matches!(
            f.trash.restore(entry.id).await,
            Err(AppError::TrashConflict(_))
        ));
        assert!(entry.trash_path.join("1.jpg").exists());
        assert!(!f.layout.home_dir("alice").join("album/1.jpg").exists());

        std::fs::remove_dir_all(f.layout.home_dir("alice").join("album")).unwrap();
        f.trash.restore(entry.id).await.unwrap();
        assert!(f.layout.home_dir("alice").join("album/1.jpg").exists());
    }

    #[tokio::test]
    async fn test_list_is_newest_first() {
        let f = fixture();
        write_home_file(&f.layout, "1.txt", 1);
        write_home_file(&f.layout, "2.txt", 1);
        let first = f.trash.soft_delete("alice", "1.txt").await.unwrap();
        let second = f.trash.soft_delete("alice", "2.txt").await.unwrap();

        let listed: Vec<Uuid> = f.trash.list("alice").iter().map(|e| e.id).collect();
        assert_eq!(listed, vec![second.id, first.id]);
        assert!(f.trash.list("bob").is_empty());
    }
}
