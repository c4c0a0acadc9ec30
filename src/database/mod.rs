use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool};

use crate::{errors::Result, models::UserStorage};

pub mod memory;
pub mod queries;

pub use memory::MemoryUsageStore;
pub use queries::UsageQueries;

/// Authoritative per-user used/quota figures. Admission decisions always go
/// through this, never through the usage cache.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn get_usage(&self, username: &str) -> Result<Option<UserStorage>>;

    /// Adds `delta` (which may be negative) to the persisted used figure,
    /// clamping at zero.
    async fn add_used_bytes(&self, username: &str, delta: i64) -> Result<()>;

    async fn ping(&self) -> Result<()>;
}

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| crate::errors::AppError::Database(e.into()))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the row for a user provisioned by the admin layer.
    pub async fn ensure_user(&self, username: &str, quota_bytes: i64) -> Result<UserStorage> {
        UsageQueries::ensure_user(&self.pool, username, quota_bytes).await
    }
}

#[async_trait]
impl UsageStore for Database {
    async fn get_usage(&self, username: &str) -> Result<Option<UserStorage>> {
        UsageQueries::find_by_username(&self.pool, username).await
    }

    async fn add_used_bytes(&self, username: &str, delta: i64) -> Result<()> {
        UsageQueries::add_used_bytes(&self.pool, username, delta).await
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
