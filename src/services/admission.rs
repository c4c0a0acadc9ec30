use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    database::UsageStore,
    errors::{AppError, Result},
    services::usage_cache::UsageCache,
};

/// Capacity held for an in-flight upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub id: Uuid,
    pub owner: String,
    pub bytes: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Allowed(Reservation),
    Rejected { quota: u64, used: u64, requested: u64 },
}

/// Pessimistic quota admission. Every decision reads the authoritative store
/// and counts outstanding reservations, under a per-owner lock, so concurrent
/// uploads for one user can never jointly exceed the quota.
pub struct AdmissionController {
    store: Arc<dyn UsageStore>,
    cache: Arc<UsageCache>,
    owner_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    reservations: Mutex<HashMap<Uuid, Reservation>>,
}

impl AdmissionController {
    pub fn new(store: Arc<dyn UsageStore>, cache: Arc<UsageCache>) -> Self {
        Self {
            store,
            cache,
            owner_locks: Mutex::new(HashMap::new()),
            reservations: Mutex::new(HashMap::new()),
        }
    }

    fn owner_lock(&self, owner: &str) -> Arc<AsyncMutex<()>> {
        self.owner_locks
            .lock()
            .entry(owner.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    pub async fn reserve(&self, owner: &str, declared: u64) -> Result<Admission> {
        let lock = self.owner_lock(owner);
        let _guard = lock.lock().await;

        let storage = self.store.get_usage(owner).await?.ok_or(AppError::NotFound)?;
        let used = storage.used().saturating_add(self.outstanding(owner));
        let quota = storage.quota();

        if used.saturating_add(declared) > quota {
            info!(owner, quota, used, requested = declared, "upload rejected by quota");
            return Ok(Admission::Rejected {
                quota,
                used,
                requested: declared,
            });
        }

        let reservation = Reservation {
            id: Uuid::new_v4(),
            owner: owner.to_string(),
            bytes: declared,
            created_at: Utc::now(),
        };
        self.reservations.lock().insert(reservation.id, reservation.clone());
        debug!(owner, bytes = declared, reservation = %reservation.id, "capacity reserved");

        Ok(Admission::Allowed(reservation))
    }

    /// Drops a reservation without touching persisted usage.
    pub async fn release(&self, reservation_id: Uuid) -> bool {
        let Some(owner) = self.reservation_owner(reservation_id) else {
            return false;
        };

        let lock = self.owner_lock(&owner);
        let _guard = lock.lock().await;
        let released = self.reservations.lock().remove(&reservation_id).is_some();
        if released {
            debug!(owner = %owner, reservation = %reservation_id, "reservation released");
        }
        released
    }

    /// Folds a finished upload into persisted usage.
    pub async fn reconcile(&self, reservation_id: Uuid, actual_bytes: u64) -> Result<()> {
        let owner = self
            .reservation_owner(reservation_id)
            .ok_or(AppError::NotFound)?;

        let lock = self.owner_lock(&owner);
        let _guard = lock.lock().await;

        // persist first: a failed write keeps the reservation so capacity stays held
        self.store
            .add_used_bytes(&owner, clamp_to_i64(actual_bytes))
            .await?;
        self.reservations.lock().remove(&reservation_id);
        self.cache.invalidate_user(&owner);

        debug!(owner = %owner, bytes = actual_bytes, "reservation reconciled");
        Ok(())
    }

    /// Returns capacity freed by a permanent delete.
    pub async fn credit(&self, owner: &str, bytes: u64) -> Result<()> {
        if bytes == 0 {
            return Ok(());
        }

        let lock = self.owner_lock(owner);
        let _guard = lock.lock().await;
        self.store.add_used_bytes(owner, -clamp_to_i64(bytes)).await?;
        self.cache.invalidate_user(owner);
        Ok(())
    }

    pub fn outstanding(&self, owner: &str) -> u64 {
        self.reservations
            .lock()
            .values()
            .filter(|r| r.owner == owner)
            .map(|r| r.bytes)
            .sum()
    }

    pub fn reservation_count(&self) -> usize {
        self.reservations.lock().len()
    }

    fn reservation_owner(&self, reservation_id: Uuid) -> Option<String> {
        self.reservations
            .lock()
            .get(&reservation_id)
            .map(|r| r.owner.clone())
    }
}

fn clamp_to_i64(bytes: u64) -> i64 {
    i64::try_from(bytes).unwrap_or(i64::MAX)
}
