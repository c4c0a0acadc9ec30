use async_trait::async_trait;
use notify::{
    event::ModifyKind, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{sleep_until, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    models::{ChangeKind, ChangeSource, EventScope, FileChangeEvent},
    services::{metrics::MetricsService, notifications::NotificationHub, usage_cache::UsageCache},
    storage::{DataLayout, StorageArea},
    utils::to_slash_path,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFsEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WatchError {
    #[error("watch backend error: {0}")]
    Backend(String),

    #[error("watch queue overflowed, events were lost")]
    Overflow,
}

/// Anything that yields raw filesystem events. `None` means the source is gone.
#[async_trait]
pub trait EventSource: Send {
    async fn next_event(&mut self) -> Option<Result<RawFsEvent, WatchError>>;
}

/// Events pushed by hand through a channel.
pub struct ChannelSource {
    receiver: mpsc::Receiver<Result<RawFsEvent, WatchError>>,
}

impl ChannelSource {
    pub fn new(capacity: usize) -> (mpsc::Sender<Result<RawFsEvent, WatchError>>, Self) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (sender, Self { receiver })
    }
}

#[async_trait]
impl EventSource for ChannelSource {
    async fn next_event(&mut self) -> Option<Result<RawFsEvent, WatchError>> {
        self.receiver.recv().await
    }
}

/// Recursive OS-level watch on the data root.
pub struct NotifySource {
    _watcher: RecommendedWatcher,
    receiver: mpsc::Receiver<Result<RawFsEvent, WatchError>>,
}

impl NotifySource {
    pub fn new(root: &Path, capacity: usize) -> Result<Self, WatchError> {
        let (sender, receiver) = mpsc::channel(capacity.max(1));

        // runs on the backend's own thread, outside the runtime
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if event.need_rescan() {
                    let _ = sender.blocking_send(Err(WatchError::Overflow));
                    return;
                }
                let Some(kind) = map_event_kind(&event.kind) else {
                    return;
                };
                for path in event.paths {
                    if sender.blocking_send(Ok(RawFsEvent { path, kind })).is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                let _ = sender.blocking_send(Err(WatchError::Backend(e.to_string())));
            }
        })
        .map_err(|e| WatchError::Backend(e.to_string()))?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| WatchError::Backend(e.to_string()))?;

        Ok(Self {
            _watcher: watcher,
            receiver,
        })
    }
}

#[async_trait]
impl EventSource for NotifySource {
    async fn next_event(&mut self) -> Option<Result<RawFsEvent, WatchError>> {
        self.receiver.recv().await
    }
}

pub fn map_event_kind(kind: &EventKind) -> Option<ChangeKind> {
    match kind {
        EventKind::Create(_) => Some(ChangeKind::Created),
        EventKind::Modify(ModifyKind::Name(_)) => Some(ChangeKind::Renamed),
        EventKind::Modify(_) => Some(ChangeKind::Modified),
        EventKind::Remove(_) => Some(ChangeKind::Removed),
        _ => None,
    }
}

/// Paths the server itself is about to touch. The watcher sees those writes
/// too; matching events inside the window are not reported as external.
pub struct OwnWrites {
    window: Duration,
    paths: Mutex<HashMap<PathBuf, Instant>>,
}

impl OwnWrites {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            paths: Mutex::new(HashMap::new()),
        }
    }

    /// Registers `path` and everything below it.
    pub fn register(&self, path: impl Into<PathBuf>) {
        let now = Instant::now();
        let mut paths = self.paths.lock();
        paths.retain(|_, at| now.duration_since(*at) < self.window);
        paths.insert(path.into(), now);
    }

    /// True for a registered path, anything below it, and the directories
    /// created on the way to it.
    pub fn contains(&self, path: &Path) -> bool {
        let now = Instant::now();
        self.paths.lock().iter().any(|(own, at)| {
            now.duration_since(*at) < self.window
                && (path.starts_with(own) || own.starts_with(path))
        })
    }
}

/// Turns out-of-band filesystem writes into cache invalidations and
/// notifications. Bursts on one path collapse into a single event carrying
/// the latest kind once the path has been quiet for the debounce window.
pub struct ChangeWatcher {
    layout: DataLayout,
    cache: Arc<UsageCache>,
    hub: Arc<NotificationHub>,
    metrics: Arc<MetricsService>,
    own_writes: Arc<OwnWrites>,
    debounce: Duration,
}

impl ChangeWatcher {
    pub fn new(
        layout: DataLayout,
        cache: Arc<UsageCache>,
        hub: Arc<NotificationHub>,
        metrics: Arc<MetricsService>,
        own_writes: Arc<OwnWrites>,
        debounce: Duration,
    ) -> Self {
        Self {
            layout,
            cache,
            hub,
            metrics,
            own_writes,
            debounce,
        }
    }

    pub fn spawn<S>(self, source: S, token: CancellationToken) -> JoinHandle<()>
    where
        S: EventSource + 'static,
    {
        tokio::spawn(async move { self.run(source, token).await })
    }

    pub async fn run<S: EventSource>(&self, mut source: S, token: CancellationToken) {
        let mut pending: HashMap<PathBuf, (ChangeKind, Instant)> = HashMap::new();
        info!(root = %self.layout.root().display(), "filesystem watcher started");

        loop {
            let deadline = pending
                .values()
                .map(|(_, seen)| *seen + self.debounce)
                .min();

            tokio::select! {
                _ = token.cancelled() => {
                    self.flush(&mut pending, None);
                    break;
                }
                next = source.next_event() => match next {
                    Some(Ok(raw)) => {
                        if self.is_relevant(&raw.path) {
                            pending.insert(raw.path, (raw.kind, Instant::now()));
                        }
                    }
                    Some(Err(WatchError::Overflow)) => {
                        warn!("watcher queue overflowed, invalidating all usage");
                        self.metrics.record_watcher_error();
                        self.cache.invalidate_all();
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "watcher degraded");
                        self.metrics.record_watcher_error();
                    }
                    None => {
                        self.flush(&mut pending, None);
                        warn!("watch source closed, watcher stopping");
                        break;
                    }
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.flush(&mut pending, Some(Instant::now()));
                }
            }
        }

        info!("filesystem watcher stopped");
    }

    fn is_relevant(&self, path: &Path) -> bool {
        !matches!(
            self.layout.classify(path),
            StorageArea::Staging | StorageArea::Outside
        )
    }

    /// Dispatches every pending path quiet since before `now`, or all of them.
    fn flush(&self, pending: &mut HashMap<PathBuf, (ChangeKind, Instant)>, now: Option<Instant>) {
        let due: Vec<PathBuf> = pending
            .iter()
            .filter(|(_, (_, seen))| now.map_or(true, |now| *seen + self.debounce <= now))
            .map(|(path, _)| path.clone())
            .collect();

        for path in due {
            if let Some((kind, _)) = pending.remove(&path) {
                self.dispatch(&path, kind);
            }
        }
    }

    fn dispatch(&self, path: &Path, kind: ChangeKind) {
        if self.own_writes.contains(path) {
            debug!(path = %path.display(), "skipping server-originated change");
            return;
        }

        let scope = match self.layout.classify(path) {
            StorageArea::Home { owner } | StorageArea::Trash { owner } => {
                self.cache.invalidate_user(&owner);
                EventScope::User(owner)
            }
            StorageArea::Shared => {
                self.cache.invalidate_all();
                EventScope::Shared
            }
            StorageArea::Staging | StorageArea::Outside => return,
        };

        let relative = self
            .layout
            .relative(path)
            .map(to_slash_path)
            .unwrap_or_default();
        debug!(path = %relative, ?kind, "external change");

        self.metrics.record_watcher_event();
        self.hub
            .publish(FileChangeEvent::new(relative, kind, ChangeSource::SmbExternal, scope));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        database::MemoryUsageStore, services::notifications::SubscriptionFilter,
        storage::FsTreeSizer,
    };
    use notify::event::{CreateKind, RenameMode};
    use tokio::time::timeout;

    struct Fixture {
        _temp_dir: tempfile::TempDir,
        layout: DataLayout,
        cache: Arc<UsageCache>,
        hub: Arc<NotificationHub>,
        metrics: Arc<MetricsService>,
        own_writes: Arc<OwnWrites>,
    }

    fn fixture() -> Fixture {
        let temp_dir = tempfile::tempdir().unwrap();
        let layout = DataLayout::new(temp_dir.path());
        let metrics = Arc::new(MetricsService::new().unwrap());
        let cache = Arc::new(UsageCache::new(
            layout.clone(),
            Arc::new(MemoryUsageStore::new().with_user("alice", 1000)),
            Arc::new(FsTreeSizer),
            metrics.clone(),
            Duration::from_secs(60),
        ));
        let hub = Arc::new(NotificationHub::new(16, metrics.clone()));
        Fixture {
            _temp_dir: temp_dir,
            layout,
            cache,
            hub,
            metrics,
            own_writes: Arc::new(OwnWrites::new(Duration::from_secs(5))),
        }
    }

    fn watcher(f: &Fixture, debounce: Duration) -> ChangeWatcher {
        ChangeWatcher::new(
            f.layout.clone(),
            f.cache.clone(),
            f.hub.clone(),
            f.metrics.clone(),
            f.own_writes.clone(),
            debounce,
        )
    }

    fn raw(path: PathBuf, kind: ChangeKind) -> Result<RawFsEvent, WatchError> {
        Ok(RawFsEvent { path, kind })
    }

    #[test]
    fn test_event_kind_mapping() {
        assert_eq!(
            map_event_kind(&EventKind::Create(CreateKind::File)),
            Some(ChangeKind::Created)
        );
        assert_eq!(
            map_event_kind(&EventKind::Modify(ModifyKind::Name(RenameMode::Both))),
            Some(ChangeKind::Renamed)
        );
        assert_eq!(map_event_kind(&EventKind::Any), None);
    }

    #[tokio::test]
    async fn test_burst_collapses_to_latest_kind_and_invalidates() {
        let f = fixture();
        f.cache.get_user_usage("alice").await.unwrap();
        assert!(f.cache.get_user_usage("alice").await.unwrap().cached);

        let mut subscription = f.hub.subscribe(SubscriptionFilter::for_user("alice"));
        let (tx, source) = ChannelSource::new(16);
        let token = CancellationToken::new();
        let handle = watcher(&f, Duration::from_millis(30)).spawn(source, token.clone());

        let file = f.layout.home_dir("alice").join("doc.txt");
        tx.send(raw(file.clone(), ChangeKind::Created)).await.unwrap();
        tx.send(raw(file.clone(), ChangeKind::Modified)).await.unwrap();
        tx.send(raw(f.layout.staging_file(&uuid::Uuid::new_v4()), ChangeKind::Modified))
            .await
            .unwrap();

        let event = timeout(Duration::from_secs(2), subscription.receiver.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.path, "home/alice/doc.txt");
        assert_eq!(event.kind, ChangeKind::Modified);
        assert_eq!(event.source, ChangeSource::SmbExternal);
        assert!(timeout(Duration::from_millis(150), subscription.receiver.recv())
            .await
            .is_err());

        assert!(!f.cache.get_user_usage("alice").await.unwrap().cached);

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_errors_do_not_stop_the_loop() {
        let f = fixture();
        let mut subscription = f.hub.subscribe(SubscriptionFilter::for_user("alice"));
        let (tx, source) = ChannelSource::new(16);
        let token = CancellationToken::new();
        let handle = watcher(&f, Duration::from_millis(10)).spawn(source, token.clone());

        tx.send(Err(WatchError::Backend("inotify limit".into()))).await.unwrap();
        tx.send(raw(f.layout.shared_dir().join("team.doc"), ChangeKind::Created))
            .await
            .unwrap();

        let event = timeout(Duration::from_secs(2), subscription.receiver.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.path, "shared/team.doc");
        assert_eq!(event.scope, EventScope::Shared);
        assert!(f.metrics.render().unwrap().contains("watcher_errors_total 1"));

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_source_flushes_pending_and_stops() {
        let f = fixture();
        let mut subscription = f.hub.subscribe(SubscriptionFilter::for_user("alice"));
        let (tx, source) = ChannelSource::new(16);
        let handle = watcher(&f, Duration::from_secs(30)).spawn(source, CancellationToken::new());

        tx.send(raw(f.layout.trash_dir("alice").join("x/a.txt"), ChangeKind::Removed))
            .await
            .unwrap();
        drop(tx);

        timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        let event = subscription.receiver.try_recv().unwrap();
        assert_eq!(event.path, "trash/alice/x/a.txt");
        assert_eq!(event.kind, ChangeKind::Removed);
    }

    #[test]
    fn test_own_writes_cover_descendants_ancestors_and_expire() {
        let own = OwnWrites::new(Duration::from_secs(60));
        own.register("/data/trash/alice/1234");

        assert!(own.contains(Path::new("/data/trash/alice/1234")));
        assert!(own.contains(Path::new("/data/trash/alice/1234/docs/a.txt")));
        assert!(own.contains(Path::new("/data/trash/alice")));
        assert!(!own.contains(Path::new("/data/trash/alice/5678")));
        assert!(!own.contains(Path::new("/data/home/alice/a.txt")));

        let expired = OwnWrites::new(Duration::ZERO);
        expired.register("/data/home/alice/a.txt");
        assert!(!expired.contains(Path::new("/data/home/alice/a.txt")));
    }

    #[tokio::test]
    async fn test_server_originated_changes_are_not_republished() {
        let f = fixture();
        let mut subscription = f.hub.subscribe(SubscriptionFilter::for_user("alice"));
        let (tx, source) = ChannelSource::new(16);
        let token = CancellationToken::new();
        let handle = watcher(&f, Duration::from_millis(10)).spawn(source, token.clone());

        let uploaded = f.layout.home_dir("alice").join("docs/upload.bin");
        f.own_writes.register(uploaded.clone());
        tx.send(raw(uploaded, ChangeKind::Created)).await.unwrap();
        tx.send(raw(f.layout.home_dir("alice").join("docs"), ChangeKind::Created))
            .await
            .unwrap();

        let external = f.layout.home_dir("alice").join("smb.doc");
        tx.send(raw(external, ChangeKind::Created)).await.unwrap();

        let event = timeout(Duration::from_secs(2), subscription.receiver.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.path, "home/alice/smb.doc");
        assert_eq!(event.source, ChangeSource::SmbExternal);
        assert!(timeout(Duration::from_millis(100), subscription.receiver.recv())
            .await
            .is_err());

        token.cancel();
        handle.await.unwrap();
    }
}
