use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::{
    collections::HashMap,
    net::IpAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    config::Config,
    errors::{AppError, Result},
    models::{
        ChangeKind, ChangeSource, EventScope, FileChangeEvent, NewUpload, UploadInfo,
        UploadSession, UploadStatus,
    },
    services::{
        admission::{Admission, AdmissionController},
        metrics::MetricsService,
        notifications::NotificationHub,
        usage_cache::UsageCache,
        watcher::OwnWrites,
    },
    storage::{self, DataLayout, Placement, HOME_DIR},
    utils::to_slash_path,
};

#[derive(Debug, Clone)]
pub struct UploadSettings {
    pub max_upload_size: u64,
    pub idle_timeout: Duration,
    pub max_uploads_per_client: usize,
}

impl From<&Config> for UploadSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_upload_size: config.max_upload_size,
            idle_timeout: config.upload_idle_timeout(),
            max_uploads_per_client: config.max_uploads_per_client,
        }
    }
}

struct SessionHandle {
    owner: String,
    state: AsyncMutex<UploadSession>,
}

/// Owns resumable upload sessions from creation to promotion.
///
/// Each session has its own async lock, so appends to one upload are
/// serialized while different uploads proceed in parallel. Terminal
/// transitions happen under that lock, which makes them happen exactly once.
pub struct UploadManager {
    layout: DataLayout,
    admission: Arc<AdmissionController>,
    cache: Arc<UsageCache>,
    hub: Arc<NotificationHub>,
    metrics: Arc<MetricsService>,
    own_writes: Arc<OwnWrites>,
    settings: UploadSettings,
    sessions: RwLock<HashMap<Uuid, Arc<SessionHandle>>>,
    per_client: Mutex<HashMap<IpAddr, usize>>,
}

impl UploadManager {
    pub fn new(
        layout: DataLayout,
        admission: Arc<AdmissionController>,
        cache: Arc<UsageCache>,
        hub: Arc<NotificationHub>,
        metrics: Arc<MetricsService>,
        own_writes: Arc<OwnWrites>,
        settings: UploadSettings,
    ) -> Self {
        Self {
            layout,
            admission,
            cache,
            hub,
            metrics,
            own_writes,
            settings,
            sessions: RwLock::new(HashMap::new()),
            per_client: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &UploadSettings {
        &self.settings
    }

    pub async fn create(&self, new: NewUpload) -> Result<UploadSession> {
        let (relative, absolute) = self.layout.resolve_home_path(&new.owner, &new.target_path)?;

        if new.declared_length > self.settings.max_upload_size {
            self.metrics.record_upload_rejected();
            return Err(AppError::UploadTooLarge {
                max: self.settings.max_upload_size,
            });
        }

        self.acquire_client_slot(new.client_addr)?;

        let overwrite = new.metadata.overwrite;
        if !overwrite && storage::path_exists(&absolute).await {
            self.release_client_slot(new.client_addr);
            return Err(AppError::Conflict(to_slash_path(&relative)));
        }

        let reservation = match self.admission.reserve(&new.owner, new.declared_length).await {
            Ok(Admission::Allowed(reservation)) => reservation,
            Ok(Admission::Rejected {
                quota,
                used,
                requested,
            }) => {
                self.release_client_slot(new.client_addr);
                self.metrics.record_upload_rejected();
                return Err(AppError::QuotaExceeded {
                    quota,
                    used,
                    requested,
                });
            }
            Err(e) => {
                self.release_client_slot(new.client_addr);
                return Err(e);
            }
        };

        let id = Uuid::new_v4();
        if let Err(e) = storage::create_empty_file(&self.layout.staging_file(&id)).await {
            self.admission.release(reservation.id).await;
            self.release_client_slot(new.client_addr);
            return Err(e.into());
        }

        let now = Utc::now();
        let session = UploadSession {
            id,
            owner: new.owner.clone(),
            target_path: relative,
            declared_length: new.declared_length,
            bytes_received: 0,
            status: UploadStatus::Created,
            created_at: now,
            last_activity: now,
            client_addr: new.client_addr,
            metadata: new.metadata.into_map(),
            overwrite,
            reservation_id: reservation.id,
        };

        let handle = Arc::new(SessionHandle {
            owner: new.owner,
            state: AsyncMutex::new(session),
        });
        self.sessions.write().insert(id, handle.clone());
        self.metrics.record_upload_created();

        let mut session = handle.state.lock().await;
        info!(
            upload = %id,
            owner = %session.owner,
            length = session.declared_length,
            "upload session created"
        );

        if session.declared_length == 0 {
            self.finalize(&mut session).await?;
        }

        Ok(session.clone())
    }

    pub async fn append(&self, id: Uuid, offset: u64, chunk: &[u8]) -> Result<UploadSession> {
        let handle = self.handle(id)?;
        let mut session = handle.state.lock().await;

        if session.status.is_terminal() {
            return Err(AppError::SessionNotFound);
        }
        if self.is_expired(&session) {
            self.terminate(&mut session, "expired").await;
            return Err(AppError::SessionExpired);
        }
        if offset != session.bytes_received {
            return Err(AppError::OffsetConflict {
                expected: session.bytes_received,
                got: offset,
            });
        }

        let end = offset
            .checked_add(chunk.len() as u64)
            .filter(|end| *end <= session.declared_length)
            .ok_or(AppError::UploadTooLarge {
                max: session.declared_length,
            })?;

        if !chunk.is_empty() {
            storage::write_chunk_at(&self.layout.staging_file(&id), offset, chunk).await?;
        }

        session.bytes_received = end;
        session.status = UploadStatus::Receiving;
        session.last_activity = Utc::now();
        self.metrics.record_bytes_received(chunk.len() as u64);
        debug!(upload = %id, offset = end, length = session.declared_length, "chunk appended");

        if session.is_complete() {
            self.finalize(&mut session).await?;
        }

        Ok(session.clone())
    }

    /// Current offset and length. Refreshes the idle clock and nothing else.
    pub async fn status(&self, id: Uuid) -> Result<UploadSession> {
        let handle = self.handle(id)?;
        let mut session = handle.state.lock().await;

        if self.is_expired(&session) {
            self.terminate(&mut session, "expired").await;
            return Err(AppError::SessionExpired);
        }

        session.last_activity = Utc::now();
        Ok(session.clone())
    }

    pub async fn abort(&self, id: Uuid) -> Result<()> {
        let handle = self.handle(id)?;
        let mut session = handle.state.lock().await;

        match session.status {
            // already promoted; just forget the record
            UploadStatus::Completed => self.untrack(id),
            UploadStatus::Terminated | UploadStatus::Failed => return Err(AppError::SessionNotFound),
            _ => self.terminate(&mut session, "terminated").await,
        }
        Ok(())
    }

    /// Aborts sessions idle past the timeout, marks quiet ones as paused and
    /// evicts completed records. Returns how many sessions were aborted.
    pub async fn reap_idle(&self) -> usize {
        let handles: Vec<(Uuid, Arc<SessionHandle>)> = self
            .sessions
            .read()
            .iter()
            .map(|(id, handle)| (*id, handle.clone()))
            .collect();

        let pause_after = self.settings.idle_timeout / 2;
        let mut reaped = 0;

        for (id, handle) in handles {
            // a locked session is mid-append, so it is not idle
            let Ok(mut session) = handle.state.try_lock() else {
                continue;
            };

            let idle = idle_for(&session);
            match session.status {
                UploadStatus::Completed if idle > self.settings.idle_timeout => self.untrack(id),
                UploadStatus::Terminated | UploadStatus::Failed => self.untrack(id),
                UploadStatus::Completed => {}
                _ if idle > self.settings.idle_timeout => {
                    self.terminate(&mut session, "idle timeout").await;
                    reaped += 1;
                }
                UploadStatus::Receiving if idle > pause_after => {
                    session.status = UploadStatus::Paused;
                    debug!(upload = %id, "upload paused");
                }
                _ => {}
            }
        }

        if reaped > 0 {
            info!(reaped, "idle upload sessions aborted");
        }
        reaped
    }

    /// Non-terminal sessions owned by `owner`, oldest first.
    pub async fn list(&self, owner: &str) -> Vec<UploadInfo> {
        let handles: Vec<Arc<SessionHandle>> = self
            .sessions
            .read()
            .values()
            .filter(|handle| handle.owner == owner)
            .cloned()
            .collect();

        let mut uploads = Vec::with_capacity(handles.len());
        for handle in handles {
            let session = handle.state.lock().await;
            if !session.status.is_terminal() {
                uploads.push(UploadInfo::from(&*session));
            }
        }
        uploads.sort_by_key(|info| info.created_at);
        uploads
    }

    pub fn owner_of(&self, id: Uuid) -> Option<String> {
        self.sessions.read().get(&id).map(|handle| handle.owner.clone())
    }

    pub fn active_uploads_for(&self, addr: IpAddr) -> usize {
        self.per_client.lock().get(&addr).copied().unwrap_or(0)
    }

    pub fn tracked_sessions(&self) -> usize {
        self.sessions.read().len()
    }

    fn handle(&self, id: Uuid) -> Result<Arc<SessionHandle>> {
        self.sessions
            .read()
            .get(&id)
            .cloned()
            .ok_or(AppError::SessionNotFound)
    }

    fn is_expired(&self, session: &UploadSession) -> bool {
        !session.status.is_terminal() && idle_for(session) > self.settings.idle_timeout
    }

    async fn finalize(&self, session: &mut UploadSession) -> Result<()> {
        let staging = self.layout.staging_file(&session.id);
        let destination = self.layout.home_dir(&session.owner).join(&session.target_path);

        // only an overwrite can replace bytes that were already charged
        let replaced_bytes = if session.overwrite && storage::path_exists(&destination).await {
            Some(storage::tree_size(&destination).await.unwrap_or(0))
        } else {
            None
        };

        self.own_writes.register(destination.clone());
        let failure = match storage::promote(&staging, &destination, session.overwrite).await {
            Ok(Placement::Placed) => None,
            Ok(Placement::Occupied) => {
                warn!(upload = %session.id, "target appeared during upload, not replacing it");
                Some(AppError::Conflict(to_slash_path(&session.target_path)))
            }
            Err(e) => {
                error!(upload = %session.id, error = %e, "failed to promote upload");
                Some(AppError::FinalizeFailure(e.to_string()))
            }
        };
        if let Some(err) = failure {
            self.fail(session).await;
            return Err(err);
        }

        session.status = UploadStatus::Completed;
        session.last_activity = Utc::now();
        self.release_client_slot(session.client_addr);
        self.metrics.record_upload_finished("completed");

        if let Err(e) = self
            .admission
            .reconcile(session.reservation_id, session.declared_length)
            .await
        {
            error!(upload = %session.id, error = %e, "failed to reconcile reservation");
            self.admission.release(session.reservation_id).await;
        }
        if let Some(bytes) = replaced_bytes {
            if let Err(e) = self.admission.credit(&session.owner, bytes).await {
                warn!(upload = %session.id, error = %e, "failed to credit replaced file");
            }
        }
        self.cache.invalidate_user(&session.owner);

        let kind = if replaced_bytes.is_some() {
            ChangeKind::Modified
        } else {
            ChangeKind::Created
        };
        self.hub.publish(FileChangeEvent::new(
            home_event_path(&session.owner, &session.target_path),
            kind,
            ChangeSource::Upload,
            EventScope::User(session.owner.clone()),
        ));

        info!(
            upload = %session.id,
            owner = %session.owner,
            path = %session.target_path.display(),
            bytes = session.declared_length,
            "upload completed"
        );
        Ok(())
    }

    async fn fail(&self, session: &mut UploadSession) {
        session.status = UploadStatus::Failed;
        self.admission.release(session.reservation_id).await;
        if let Err(e) = storage::remove_if_exists(&self.layout.staging_file(&session.id)).await {
            warn!(upload = %session.id, error = %e, "failed to remove staging file");
        }
        self.release_client_slot(session.client_addr);
        self.untrack(session.id);
        self.metrics.record_upload_finished("failed");
    }

    async fn terminate(&self, session: &mut UploadSession, reason: &str) {
        session.status = UploadStatus::Terminated;
        self.admission.release(session.reservation_id).await;
        if let Err(e) = storage::remove_if_exists(&self.layout.staging_file(&session.id)).await {
            warn!(upload = %session.id, error = %e, "failed to remove staging file");
        }
        self.release_client_slot(session.client_addr);
        self.untrack(session.id);
        self.metrics.record_upload_finished("terminated");
        info!(upload = %session.id, owner = %session.owner, reason, "upload session terminated");
    }

    fn untrack(&self, id: Uuid) {
        self.sessions.write().remove(&id);
    }

    fn acquire_client_slot(&self, addr: Option<IpAddr>) -> Result<()> {
        let Some(addr) = addr else {
            return Ok(());
        };

        let mut per_client = self.per_client.lock();
        let count = per_client.entry(addr).or_insert(0);
        if *count >= self.settings.max_uploads_per_client {
            warn!(client = %addr, active = *count, "too many concurrent uploads");
            return Err(AppError::TooManyUploads);
        }
        *count += 1;
        Ok(())
    }

    fn release_client_slot(&self, addr: Option<IpAddr>) {
        let Some(addr) = addr else {
            return;
        };

        let mut per_client = self.per_client.lock();
        if let Some(count) = per_client.get_mut(&addr) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                per_client.remove(&addr);
            }
        }
    }
}

fn idle_for(session: &UploadSession) -> Duration {
    (Utc::now() - session.last_activity)
        .to_std()
        .unwrap_or(Duration::ZERO)
}

fn home_event_path(owner: &str, relative: &Path) -> String {
    to_slash_path(&PathBuf::from(HOME_DIR).join(owner).join(relative))
}
