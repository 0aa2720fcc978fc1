//! Configuration management

use serde::{Deserialize, Serialize};

use crate::storage::config::StorageConfig;

// ============================================================================
// Engine Configuration Constants
// ============================================================================

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/bulkport";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 20;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 2;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default database idle timeout in seconds.
pub const DEFAULT_DATABASE_IDLE_TIMEOUT_SECS: u64 = 30;

/// Default Redis URL for the lock backend.
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Default per-job lock TTL in seconds.
pub const DEFAULT_LOCK_TTL_SECS: u64 = 300;

/// Default number of worker slots consuming the job queue.
pub const DEFAULT_WORKER_SLOTS: usize = 2;

/// Default number of rows per pipeline batch (one DB transaction each).
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Progress counters are flushed to the DB every this many batches.
pub const DEFAULT_PROGRESS_FLUSH_BATCHES: usize = 10;

/// Default cap on accepted import file size (500 MiB).
pub const DEFAULT_MAX_FILE_SIZE_BYTES: u64 = 500 * 1024 * 1024;

/// Default stale-job sweep interval in seconds.
pub const DEFAULT_RECOVERY_INTERVAL_SECS: u64 = 300;

/// A PROCESSING job older than this is considered stale (30 minutes).
pub const DEFAULT_STALE_THRESHOLD_SECS: u64 = 1800;

/// A held job lock older than this is considered stale (10 minutes).
pub const DEFAULT_STALE_LOCK_THRESHOLD_SECS: u64 = 600;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub lock: LockConfig,
    pub worker: WorkerConfig,
    pub recovery: RecoveryConfig,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

/// Lock backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    pub redis_url: String,
    pub job_ttl_secs: u64,
}

/// Worker pool and pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub slots: usize,
    pub batch_size: usize,
    pub progress_flush_batches: usize,
    pub max_file_size_bytes: u64,
}

/// Stale-job recovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    pub interval_secs: u64,
    pub stale_threshold_secs: u64,
    pub stale_lock_threshold_secs: u64,
    /// Reset stale PROCESSING jobs to PENDING instead of failing them.
    pub restart_stale_jobs: bool,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config {
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
                max_connections: env_parse(
                    "DATABASE_MAX_CONNECTIONS",
                    DEFAULT_DATABASE_MAX_CONNECTIONS,
                ),
                min_connections: env_parse(
                    "DATABASE_MIN_CONNECTIONS",
                    DEFAULT_DATABASE_MIN_CONNECTIONS,
                ),
                connect_timeout_secs: env_parse(
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                ),
                idle_timeout_secs: env_parse(
                    "DATABASE_IDLE_TIMEOUT",
                    DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
                ),
            },
            storage: StorageConfig::from_env(),
            lock: LockConfig {
                redis_url: std::env::var("REDIS_URL")
                    .unwrap_or_else(|_| DEFAULT_REDIS_URL.to_string()),
                job_ttl_secs: env_parse("LOCK_TTL_SECS", DEFAULT_LOCK_TTL_SECS),
            },
            worker: WorkerConfig {
                slots: env_parse("WORKER_SLOTS", DEFAULT_WORKER_SLOTS),
                batch_size: env_parse("BATCH_SIZE", DEFAULT_BATCH_SIZE),
                progress_flush_batches: env_parse(
                    "PROGRESS_FLUSH_BATCHES",
                    DEFAULT_PROGRESS_FLUSH_BATCHES,
                ),
                max_file_size_bytes: env_parse("MAX_FILE_SIZE_BYTES", DEFAULT_MAX_FILE_SIZE_BYTES),
            },
            recovery: RecoveryConfig {
                interval_secs: env_parse("RECOVERY_INTERVAL_SECS", DEFAULT_RECOVERY_INTERVAL_SECS),
                stale_threshold_secs: env_parse(
                    "STALE_THRESHOLD_SECS",
                    DEFAULT_STALE_THRESHOLD_SECS,
                ),
                stale_lock_threshold_secs: env_parse(
                    "STALE_LOCK_THRESHOLD_SECS",
                    DEFAULT_STALE_LOCK_THRESHOLD_SECS,
                ),
                restart_stale_jobs: env_parse("RESTART_STALE_JOBS", true),
            },
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }
        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }
        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }
        if self.worker.slots == 0 {
            anyhow::bail!("Worker slots must be greater than 0");
        }
        if self.worker.batch_size == 0 {
            anyhow::bail!("Batch size must be greater than 0");
        }
        if self.lock.job_ttl_secs == 0 {
            anyhow::bail!("Lock TTL must be greater than 0");
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
                min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
                connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                idle_timeout_secs: DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
            },
            storage: StorageConfig::default(),
            lock: LockConfig {
                redis_url: DEFAULT_REDIS_URL.to_string(),
                job_ttl_secs: DEFAULT_LOCK_TTL_SECS,
            },
            worker: WorkerConfig {
                slots: DEFAULT_WORKER_SLOTS,
                batch_size: DEFAULT_BATCH_SIZE,
                progress_flush_batches: DEFAULT_PROGRESS_FLUSH_BATCHES,
                max_file_size_bytes: DEFAULT_MAX_FILE_SIZE_BYTES,
            },
            recovery: RecoveryConfig {
                interval_secs: DEFAULT_RECOVERY_INTERVAL_SECS,
                stale_threshold_secs: DEFAULT_STALE_THRESHOLD_SECS,
                stale_lock_threshold_secs: DEFAULT_STALE_LOCK_THRESHOLD_SECS,
                restart_stale_jobs: true,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_batch_size() {
        let mut config = Config::default();
        config.worker.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_pool_bounds() {
        let mut config = Config::default();
        config.database.min_connections = 50;
        assert!(config.validate().is_err());
    }
}
