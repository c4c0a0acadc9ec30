use parking_lot::{Mutex, RwLock};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use crate::{
    database::UsageStore,
    errors::{AppError, Result},
    models::{UsageReport, UsageSnapshot},
    services::metrics::MetricsService,
    storage::{DataLayout, TreeSizer},
    utils::validate_username,
};

struct CacheSlot {
    snapshot: UsageSnapshot,
    invalidated: bool,
}

#[derive(Default)]
struct Flight {
    // bumped by every invalidation of this owner
    generation: AtomicU64,
    // latest walk result, handed to callers that queued behind it
    last: AsyncMutex<Option<UsageSnapshot>>,
}

/// Read-through TTL cache of per-user storage figures.
///
/// Invalidated entries are kept (flagged) so that a failed recompute can still
/// serve the last known figures. Recomputes for one user are single-flight:
/// callers that queue behind an in-flight walk get its result, even when an
/// invalidation raced the walk and kept it out of the cache.
pub struct UsageCache {
    layout: DataLayout,
    store: Arc<dyn UsageStore>,
    sizer: Arc<dyn TreeSizer>,
    metrics: Arc<MetricsService>,
    ttl: Duration,
    entries: RwLock<HashMap<String, CacheSlot>>,
    flights: Mutex<HashMap<String, Arc<Flight>>>,
    // bumped by `invalidate_all`
    epoch: AtomicU64,
}

impl UsageCache {
    pub fn new(
        layout: DataLayout,
        store: Arc<dyn UsageStore>,
        sizer: Arc<dyn TreeSizer>,
        metrics: Arc<MetricsService>,
        ttl: Duration,
    ) -> Self {
        Self {
            layout,
            store,
            sizer,
            metrics,
            ttl,
            entries: RwLock::new(HashMap::new()),
            flights: Mutex::new(HashMap::new()),
            epoch: AtomicU64::new(0),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn get_user_usage(&self, owner: &str) -> Result<UsageReport> {
        validate_username(owner)?;
        let arrived = Instant::now();

        if let Some(snapshot) = self.fresh_snapshot(owner) {
            self.metrics.record_cache_hit();
            return Ok(UsageReport::from_snapshot(&snapshot, true, false));
        }

        self.metrics.record_cache_miss();
        self.recompute(owner, arrived).await
    }

    /// Always walks the trees, but still joins an in-flight walk that started
    /// after this call arrived.
    pub async fn refresh_user_usage(&self, owner: &str) -> Result<UsageReport> {
        validate_username(owner)?;
        self.recompute(owner, Instant::now()).await
    }

    pub fn invalidate_user(&self, owner: &str) {
        self.flight(owner).generation.fetch_add(1, Ordering::SeqCst);
        if let Some(slot) = self.entries.write().get_mut(owner) {
            slot.invalidated = true;
            debug!(owner, "usage cache entry invalidated");
        }
    }

    pub fn invalidate_all(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let mut entries = self.entries.write();
        for slot in entries.values_mut() {
            slot.invalidated = true;
        }
        debug!(count = entries.len(), "usage cache fully invalidated");
    }

    fn fresh_snapshot(&self, owner: &str) -> Option<UsageSnapshot> {
        self.entries
            .read()
            .get(owner)
            .filter(|slot| !slot.invalidated && slot.snapshot.is_fresh())
            .map(|slot| slot.snapshot.clone())
    }

    fn flight(&self, owner: &str) -> Arc<Flight> {
        self.flights
            .lock()
            .entry(owner.to_string())
            .or_default()
            .clone()
    }

    async fn recompute(&self, owner: &str, arrived: Instant) -> Result<UsageReport> {
        let flight = self.flight(owner);
        let mut last = flight.last.lock().await;

        // someone else finished a walk while we were queued
        if let Some(snapshot) = last.as_ref().filter(|s| s.computed_at >= arrived) {
            return Ok(UsageReport::from_snapshot(snapshot, false, false));
        }

        let epoch = self.epoch.load(Ordering::SeqCst);
        let generation = flight.generation.load(Ordering::SeqCst);
        match self.walk(owner).await {
            Ok(snapshot) => {
                let mut entries = self.entries.write();
                if self.epoch.load(Ordering::SeqCst) == epoch
                    && flight.generation.load(Ordering::SeqCst) == generation
                {
                    entries.insert(
                        owner.to_string(),
                        CacheSlot {
                            snapshot: snapshot.clone(),
                            invalidated: false,
                        },
                    );
                } else {
                    debug!(owner, "usage changed during walk, result not cached");
                }
                drop(entries);

                *last = Some(snapshot.clone());
                Ok(UsageReport::from_snapshot(&snapshot, false, false))
            }
            Err(e) => {
                let previous = self.entries.read().get(owner).map(|slot| slot.snapshot.clone());
                match previous {
                    Some(snapshot) => {
                        warn!(owner, error = %e, "usage recompute failed, serving last known figures");
                        self.metrics.record_cache_stale();
                        Ok(UsageReport::from_snapshot(&snapshot, true, true))
                    }
                    None => Err(e),
                }
            }
        }
    }

    async fn walk(&self, owner: &str) -> Result<UsageSnapshot> {
        let home_dir = self.layout.home_dir(owner);
        let shared_dir = self.layout.shared_dir();
        let trash_dir = self.layout.trash_dir(owner);

        let (home, shared, trash, stored) = tokio::join!(
            self.sizer.tree_size(&home_dir),
            self.sizer.tree_size(&shared_dir),
            self.sizer.tree_size(&trash_dir),
            self.store.get_usage(owner),
        );

        let quota = stored?.map(|u| u.quota()).unwrap_or(0);
        let snapshot = UsageSnapshot::new(
            home.map_err(AppError::Io)?,
            shared.map_err(AppError::Io)?,
            trash.map_err(AppError::Io)?,
            quota,
            self.ttl,
        );

        debug!(
            owner,
            home = snapshot.home_used,
            shared = snapshot.shared_used,
            trash = snapshot.trash_used,
            "usage recomputed"
        );
        Ok(snapshot)
    }
}
