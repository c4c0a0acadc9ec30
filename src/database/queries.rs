use sqlx::PgPool;

use crate::{errors::Result, models::UserStorage};

pub struct UsageQueries;

impl UsageQueries {
    pub async fn find_by_username(pool: &PgPool, username: &str) -> Result<Option<UserStorage>> {
        let usage = sqlx::query_as::<_, UserStorage>(
            "SELECT username, quota_bytes, used_bytes FROM user_storage WHERE username = $1",
        )
        .bind(username)
        .fetch_optional(pool)
        .await?;

        Ok(usage)
    }

    pub async fn add_used_bytes(pool: &PgPool, username: &str, delta: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE user_storage
            SET used_bytes = GREATEST(used_bytes + $1, 0), updated_at = NOW()
            WHERE username = $2
            "#,
        )
        .bind(delta)
        .bind(username)
        .execute(pool)
        .await?;

        Ok(())
    }

    pub async fn ensure_user(pool: &PgPool, username: &str, quota_bytes: i64) -> Result<UserStorage> {
        let usage = sqlx::query_as::<_, UserStorage>(
            r#"
            INSERT INTO user_storage (username, quota_bytes, used_bytes)
            VALUES ($1, $2, 0)
            ON CONFLICT (username) DO UPDATE SET username = EXCLUDED.username
            RETURNING username, quota_bytes, used_bytes
            "#,
        )
        .bind(username)
        .bind(quota_bytes)
        .fetch_one(pool)
        .await?;

        Ok(usage)
    }

    pub async fn set_quota(pool: &PgPool, username: &str, quota_bytes: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE user_storage SET quota_bytes = $1, updated_at = NOW() WHERE username = $2",
        )
        .bind(quota_bytes)
        .bind(username)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
