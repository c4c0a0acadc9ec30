use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::{Duration, Instant};

/// One computed view of a user's storage, as held by the usage cache.
#[derive(Debug, Clone)]
pub struct UsageSnapshot {
    pub home_used: u64,
    pub shared_used: u64,
    pub trash_used: u64,
    pub total_used: u64,
    pub quota: u64,
    pub cached_at: DateTime<Utc>,
    pub computed_at: Instant,
    pub ttl: Duration,
}

impl UsageSnapshot {
    pub fn new(home_used: u64, shared_used: u64, trash_used: u64, quota: u64, ttl: Duration) -> Self {
        Self {
            home_used,
            shared_used,
            trash_used,
            // shared storage is a separate pool and never counts against the user quota
            total_used: home_used + trash_used,
            quota,
            cached_at: Utc::now(),
            computed_at: Instant::now(),
            ttl,
        }
    }

    pub fn is_fresh(&self) -> bool {
        self.computed_at.elapsed() < self.ttl
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageReport {
    pub home_used: u64,
    pub shared_used: u64,
    pub trash_used: u64,
    pub total_used: u64,
    pub quota: u64,
    pub cached: bool,
    pub cached_at: DateTime<Utc>,
    pub stale: bool,
}

impl UsageReport {
    pub fn from_snapshot(snapshot: &UsageSnapshot, cached: bool, stale: bool) -> Self {
        Self {
            home_used: snapshot.home_used,
            shared_used: snapshot.shared_used,
            trash_used: snapshot.trash_used,
            total_used: snapshot.total_used,
            quota: snapshot.quota,
            cached,
            cached_at: snapshot.cached_at,
            stale,
        }
    }
}
