//! Worker process entry point
//!
//! Loads configuration, wires the database pool, object storage, lock
//! manager and the in-process queue, then runs N worker slots plus the
//! stale-job sweeper until SIGINT.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::info;

use bulkport_common::logging::{init_logging, LogConfig};
use bulkport_lock::{LockManager, RedisLockBackend};
use bulkport_server::config::Config;
use bulkport_server::export::ExportProcessor;
use bulkport_server::import::{ImportProcessor, UpsertEngine};
use bulkport_server::jobs::{InProcessQueue, JobQueue, JobStore, StaleJobSweeper};
use bulkport_server::storage::Storage;
use bulkport_server::worker::WorkerPool;
use bulkport_server::{db, ResourceType};

#[tokio::main]
async fn main() -> Result<()> {
    let log_config = LogConfig::from_env()?;
    init_logging(&log_config)?;

    let config = Config::load()?;
    info!(
        worker_slots = config.worker.slots,
        batch_size = config.worker.batch_size,
        "bulkport worker starting"
    );

    let pool = db::connect(&config.database)
        .await
        .context("database connection failed")?;
    let storage = Storage::new(config.storage.clone())
        .await
        .context("storage initialization failed")?;

    let node_id = node_id();
    info!(node_id = %node_id, "node identity assigned");
    let lock_backend = RedisLockBackend::new(&config.lock.redis_url)
        .await
        .context("redis connection failed")?;
    let lock = LockManager::new(Arc::new(lock_backend), node_id);

    let store = JobStore::new(pool.clone());
    let lock_ttl = Duration::from_secs(config.lock.job_ttl_secs);

    let (queue, queue_rx) = InProcessQueue::new(1024);
    let queue_handle: Arc<dyn JobQueue> = Arc::new(queue.clone());

    let import = Arc::new(ImportProcessor::new(
        store.clone(),
        UpsertEngine::new(pool.clone()),
        storage.clone(),
        lock.clone(),
        config.worker.clone(),
        lock_ttl,
    ));
    let export = Arc::new(ExportProcessor::new(
        store.clone(),
        storage.clone(),
        lock.clone(),
        config.worker.clone(),
        lock_ttl,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sweeper = StaleJobSweeper::new(
        store.clone(),
        lock.clone(),
        queue_handle,
        config.recovery.clone(),
    );
    let sweeper_handle = sweeper.start(shutdown_rx.clone());

    let pool_handles = WorkerPool::new(import, export, queue, config.worker.slots)
        .start(queue_rx, shutdown_rx);

    info!(
        resources = ?[ResourceType::Users, ResourceType::Articles, ResourceType::Comments],
        "bulkport worker ready"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");

    shutdown_tx.send(true).ok();
    for handle in pool_handles {
        handle.await.ok();
    }
    sweeper_handle.await.ok();

    info!("bulkport worker stopped");
    Ok(())
}

/// Stable per-process identity: hostname plus a short random suffix, shown
/// in lock tokens and `locked_by` columns.
fn node_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", host, &suffix[..8])
}
