use anyhow::{Context, Result};
use serde::Deserialize;
use std::{env, path::PathBuf, str::FromStr, time::Duration};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub data_root: PathBuf,
    pub jwt_secret: String,
    pub max_upload_size: u64,
    pub max_chunk_size: usize,
    pub upload_idle_timeout_secs: u64,
    pub upload_reap_interval_secs: u64,
    pub max_uploads_per_client: usize,
    pub trust_forwarded_for: bool,
    pub usage_cache_ttl_secs: u64,
    pub watcher_enabled: bool,
    pub watch_debounce_ms: u64,
    pub watch_queue_capacity: usize,
    pub trash_retention_days: u64,
    pub trash_sweep_interval_secs: u64,
    pub notification_buffer: usize,
    pub default_quota_bytes: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "postgresql://localhost/file_storage".to_string(),
            port: 3000,
            data_root: PathBuf::from("./data"),
            jwt_secret: "your-secret-key".to_string(),
            max_upload_size: 10 * 1024 * 1024 * 1024, // 10GB
            max_chunk_size: 64 * 1024 * 1024,
            upload_idle_timeout_secs: 86400,
            upload_reap_interval_secs: 300,
            max_uploads_per_client: 16,
            trust_forwarded_for: false,
            usage_cache_ttl_secs: 10,
            watcher_enabled: true,
            watch_debounce_ms: 500,
            watch_queue_capacity: 1024,
            trash_retention_days: 30,
            trash_sweep_interval_secs: 86400,
            notification_buffer: 256,
            default_quota_bytes: 1073741824, // 1GB
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = Config::default();

        Ok(Config {
            database_url: env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            port: var_or("PORT", defaults.port)?,
            data_root: env::var("DATA_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_root),
            jwt_secret: env::var("JWT_SECRET").unwrap_or(defaults.jwt_secret),
            max_upload_size: var_or("MAX_UPLOAD_SIZE", defaults.max_upload_size)?,
            max_chunk_size: var_or("MAX_CHUNK_SIZE", defaults.max_chunk_size)?,
            upload_idle_timeout_secs: var_or(
                "UPLOAD_IDLE_TIMEOUT_SECS",
                defaults.upload_idle_timeout_secs,
            )?,
            upload_reap_interval_secs: var_or(
                "UPLOAD_REAP_INTERVAL_SECS",
                defaults.upload_reap_interval_secs,
            )?,
            max_uploads_per_client: var_or(
                "MAX_UPLOADS_PER_CLIENT",
                defaults.max_uploads_per_client,
            )?,
            trust_forwarded_for: var_or("TRUST_FORWARDED_FOR", defaults.trust_forwarded_for)?,
            usage_cache_ttl_secs: var_or("USAGE_CACHE_TTL_SECS", defaults.usage_cache_ttl_secs)?,
            watcher_enabled: var_or("WATCHER_ENABLED", defaults.watcher_enabled)?,
            watch_debounce_ms: var_or("WATCH_DEBOUNCE_MS", defaults.watch_debounce_ms)?,
            watch_queue_capacity: var_or("WATCH_QUEUE_CAPACITY", defaults.watch_queue_capacity)?,
            trash_retention_days: var_or("TRASH_RETENTION_DAYS", defaults.trash_retention_days)?,
            trash_sweep_interval_secs: var_or(
                "TRASH_SWEEP_INTERVAL_SECS",
                defaults.trash_sweep_interval_secs,
            )?,
            notification_buffer: var_or("NOTIFICATION_BUFFER", defaults.notification_buffer)?,
            default_quota_bytes: var_or("DEFAULT_QUOTA_BYTES", defaults.default_quota_bytes)?,
        })
    }

    pub fn upload_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_idle_timeout_secs)
    }

    pub fn upload_reap_interval(&self) -> Duration {
        Duration::from_secs(self.upload_reap_interval_secs)
    }

    pub fn usage_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.usage_cache_ttl_secs)
    }

    pub fn watch_debounce(&self) -> Duration {
        Duration::from_millis(self.watch_debounce_ms)
    }

    /// How long the watcher ignores paths the server just wrote.
    pub fn own_write_window(&self) -> Duration {
        self.watch_debounce() * 2 + Duration::from_secs(5)
    }

    pub fn trash_retention(&self) -> Duration {
        Duration::from_secs(self.trash_retention_days * 24 * 3600)
    }

    pub fn trash_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.trash_sweep_interval_secs)
    }
}

fn var_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {}: {:?}", key, raw)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_defaults_without_env() {
        env::remove_var("USAGE_CACHE_TTL_SECS");
        env::remove_var("WATCH_DEBOUNCE_MS");

        let config = Config::from_env().unwrap();
        assert_eq!(config.usage_cache_ttl(), Duration::from_secs(10));
        assert_eq!(config.watch_debounce(), Duration::from_millis(500));
        assert_eq!(config.trash_retention(), Duration::from_secs(30 * 86400));
        assert_eq!(config.own_write_window(), Duration::from_secs(6));
        assert!(!config.trust_forwarded_for);
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        env::set_var("USAGE_CACHE_TTL_SECS", "42");
        env::set_var("WATCHER_ENABLED", "false");

        let config = Config::from_env().unwrap();
        assert_eq!(config.usage_cache_ttl_secs, 42);
        assert!(!config.watcher_enabled);

        env::remove_var("USAGE_CACHE_TTL_SECS");
        env::remove_var("WATCHER_ENABLED");
    }

    #[test]
    #[serial]
    fn test_invalid_value_is_reported() {
        env::set_var("PORT", "not-a-port");

        let err = Config::from_env().unwrap_err();
        assert!(err.to_string().contains("PORT"));

        env::remove_var("PORT");
    }
}
