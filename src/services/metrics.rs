use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::errors::Result;

pub struct MetricsService {
    registry: Registry,
    uploads: IntCounterVec,
    upload_bytes: IntCounter,
    active_uploads: IntGauge,
    cache_lookups: IntCounterVec,
    watcher_events: IntCounter,
    watcher_errors: IntCounter,
    notifications_dropped: IntCounter,
    trash_purged: IntCounter,
}

impl MetricsService {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let uploads = IntCounterVec::new(
            Opts::new("uploads_total", "Resumable upload sessions by outcome"),
            &["outcome"],
        )?;
        let upload_bytes = IntCounter::new("upload_bytes_received_total", "Bytes accepted by PATCH requests")?;
        let active_uploads = IntGauge::new("uploads_active", "Non-terminal upload sessions")?;
        let cache_lookups = IntCounterVec::new(
            Opts::new("usage_cache_lookups_total", "Usage cache lookups by result"),
            &["result"],
        )?;
        let watcher_events = IntCounter::new("watcher_events_total", "Debounced filesystem change events")?;
        let watcher_errors = IntCounter::new("watcher_errors_total", "Errors reported by the event source")?;
        let notifications_dropped = IntCounter::new(
            "notifications_dropped_total",
            "Events dropped because a subscriber buffer was full",
        )?;
        let trash_purged = IntCounter::new("trash_purged_total", "Trash entries permanently deleted")?;

        registry.register(Box::new(uploads.clone()))?;
        registry.register(Box::new(upload_bytes.clone()))?;
        registry.register(Box::new(active_uploads.clone()))?;
        registry.register(Box::new(cache_lookups.clone()))?;
        registry.register(Box::new(watcher_events.clone()))?;
        registry.register(Box::new(watcher_errors.clone()))?;
        registry.register(Box::new(notifications_dropped.clone()))?;
        registry.register(Box::new(trash_purged.clone()))?;

        Ok(Self {
            registry,
            uploads,
            upload_bytes,
            active_uploads,
            cache_lookups,
            watcher_events,
            watcher_errors,
            notifications_dropped,
            trash_purged,
        })
    }

    pub fn record_upload_created(&self) {
        self.uploads.with_label_values(&["created"]).inc();
        self.active_uploads.inc();
    }

    pub fn record_upload_rejected(&self) {
        self.uploads.with_label_values(&["rejected"]).inc();
    }

    /// `outcome` is one of `completed`, `terminated`, `failed`.
    pub fn record_upload_finished(&self, outcome: &str) {
        self.uploads.with_label_values(&[outcome]).inc();
        self.active_uploads.dec();
    }

    pub fn record_bytes_received(&self, bytes: u64) {
        self.upload_bytes.inc_by(bytes);
    }

    pub fn record_cache_hit(&self) {
        self.cache_lookups.with_label_values(&["hit"]).inc();
    }

    pub fn record_cache_miss(&self) {
        self.cache_lookups.with_label_values(&["miss"]).inc();
    }

    pub fn record_cache_stale(&self) {
        self.cache_lookups.with_label_values(&["stale"]).inc();
    }

    pub fn record_watcher_event(&self) {
        self.watcher_events.inc();
    }

    pub fn record_watcher_error(&self) {
        self.watcher_errors.inc();
    }

    pub fn record_notification_dropped(&self) {
        self.notifications_dropped.inc();
    }

    pub fn record_trash_purged(&self, count: u64) {
        self.trash_purged.inc_by(count);
    }

    pub fn active_uploads(&self) -> i64 {
        self.active_uploads.get()
    }

    pub fn dropped_notifications(&self) -> u64 {
        self.notifications_dropped.get()
    }

    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| anyhow::anyhow!(e).into())
    }
}
