use std::sync::Arc;

use crate::{
    auth::JwtService,
    config::Config,
    database::UsageStore,
    errors::Result,
    services::{
        AdmissionController, MetricsService, NotificationHub, OwnWrites, TrashManager,
        UploadManager, UploadSettings, UsageCache,
    },
    storage::{DataLayout, FsTreeSizer},
};

pub mod events;
pub mod health;
pub mod metrics;
pub mod trash;
pub mod uploads;
pub mod usage;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub layout: DataLayout,
    pub store: Arc<dyn UsageStore>,
    pub admission: Arc<AdmissionController>,
    pub usage: Arc<UsageCache>,
    pub uploads: Arc<UploadManager>,
    pub trash: Arc<TrashManager>,
    pub hub: Arc<NotificationHub>,
    pub metrics: Arc<MetricsService>,
    pub own_writes: Arc<OwnWrites>,
    pub jwt: JwtService,
}

impl AppState {
    /// Wires every service together. The data root is created if missing.
    pub async fn build(config: Config, store: Arc<dyn UsageStore>) -> Result<Self> {
        let layout = DataLayout::new(&config.data_root).prepare().await?;
        let metrics = Arc::new(MetricsService::new()?);

        let usage = Arc::new(UsageCache::new(
            layout.clone(),
            store.clone(),
            Arc::new(FsTreeSizer),
            metrics.clone(),
            config.usage_cache_ttl(),
        ));
        let admission = Arc::new(AdmissionController::new(store.clone(), usage.clone()));
        let hub = Arc::new(NotificationHub::new(config.notification_buffer, metrics.clone()));
        let own_writes = Arc::new(OwnWrites::new(config.own_write_window()));
        let uploads = Arc::new(UploadManager::new(
            layout.clone(),
            admission.clone(),
            usage.clone(),
            hub.clone(),
            metrics.clone(),
            own_writes.clone(),
            UploadSettings::from(&config),
        ));
        let trash = Arc::new(TrashManager::new(
            layout.clone(),
            usage.clone(),
            hub.clone(),
            admission.clone(),
            metrics.clone(),
            own_writes.clone(),
            config.trash_retention(),
        ));
        let jwt = JwtService::new(&config.jwt_secret);

        Ok(Self {
            config: Arc::new(config),
            layout,
            store,
            admission,
            usage,
            uploads,
            trash,
            hub,
            metrics,
            own_writes,
            jwt,
        })
    }
}
