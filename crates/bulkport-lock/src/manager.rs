//! Lease manager
//!
//! Wraps a [`LockBackend`] with node identity, bounded retry, background
//! renewal at half-TTL, and a process-wide held-key guard (two tasks in one
//! process must never contend on the backend for the same key).
//!
//! Renewal is best-effort: a lost lease is flagged on the lock but does not
//! interrupt the holder. Callers protect their critical writes with status
//! and version preconditions at the store instead.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{LockBackend, LockError};

/// A held lease on a string key.
///
/// Dropping the lock stops renewal and releases the process-wide key guard;
/// the backend key is then left to expire on its own. Call
/// [`LockManager::release`] for an immediate backend release.
pub struct Lock {
    key: String,
    token: String,
    expires_at: DateTime<Utc>,
    lost: Arc<AtomicBool>,
    renewal: Option<JoinHandle<()>>,
    _held: HeldKeyGuard,
}

impl Lock {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Expiry of the lease as initially granted (renewal pushes the real
    /// expiry further out on the backend).
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// True once a renewal observed that the backend no longer holds our
    /// token. The holder keeps running; its next guarded store write will
    /// no-op instead.
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        if let Some(handle) = self.renewal.take() {
            handle.abort();
        }
    }
}

struct HeldKeyGuard {
    key: String,
    held: Arc<Mutex<HashSet<String>>>,
}

impl Drop for HeldKeyGuard {
    fn drop(&mut self) {
        if let Ok(mut held) = self.held.lock() {
            held.remove(&self.key);
        }
    }
}

/// Issues and renews leases on behalf of one process.
#[derive(Clone)]
pub struct LockManager {
    backend: Arc<dyn LockBackend>,
    node_id: String,
    held: Arc<Mutex<HashSet<String>>>,
}

impl LockManager {
    /// Create a manager with an explicit node id (stable for the process
    /// lifetime; shows up in lock tokens and job ownership columns).
    pub fn new(backend: Arc<dyn LockBackend>, node_id: impl Into<String>) -> Self {
        Self {
            backend,
            node_id: node_id.into(),
            held: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Attempt to take the lease on `key`.
    ///
    /// Tries once plus `retries` more times with a fixed `retry_delay`
    /// between attempts. Returns `None` when the key stays held by someone
    /// else (or by another task in this very process) for all attempts.
    pub async fn acquire(
        &self,
        key: &str,
        ttl: Duration,
        retries: u32,
        retry_delay: Duration,
    ) -> Result<Option<Lock>, LockError> {
        {
            let mut held = self
                .held
                .lock()
                .map_err(|_| LockError::Backend("held-key set poisoned".to_string()))?;
            if !held.insert(key.to_string()) {
                warn!(key = %key, "lock already held by this process, refusing re-entry");
                return Ok(None);
            }
        }
        let held_guard = HeldKeyGuard {
            key: key.to_string(),
            held: self.held.clone(),
        };

        let token = format!("{}:{}", self.node_id, Uuid::new_v4());

        for attempt in 0..=retries {
            if self.backend.try_acquire(key, &token, ttl).await? {
                debug!(key = %key, attempt, "lock acquired");
                let lost = Arc::new(AtomicBool::new(false));
                let renewal = self.spawn_renewal(key, &token, ttl, lost.clone());
                return Ok(Some(Lock {
                    key: key.to_string(),
                    token,
                    expires_at: Utc::now()
                        + chrono::Duration::from_std(ttl)
                            .unwrap_or_else(|_| chrono::Duration::seconds(0)),
                    lost,
                    renewal: Some(renewal),
                    _held: held_guard,
                }));
            }
            if attempt < retries {
                tokio::time::sleep(retry_delay).await;
            }
        }

        debug!(key = %key, "lock not acquired");
        Ok(None)
    }

    /// Release the lease. Returns false when the backend no longer held our
    /// token (expired and taken over, or already released).
    pub async fn release(&self, mut lock: Lock) -> Result<bool, LockError> {
        if let Some(handle) = lock.renewal.take() {
            handle.abort();
        }
        let released = self.backend.release(&lock.key, &lock.token).await?;
        if !released {
            warn!(key = %lock.key, "release found a foreign or missing token");
        }
        Ok(released)
    }

    pub async fn is_locked(&self, key: &str) -> Result<bool, LockError> {
        Ok(self.backend.holder(key).await?.is_some())
    }

    pub async fn holder(&self, key: &str) -> Result<Option<String>, LockError> {
        self.backend.holder(key).await
    }

    /// Run `f` under the lease on `key`; release on every exit path.
    ///
    /// Returns `None` without running `f` when the lease is unavailable.
    pub async fn with_lock<F, Fut, T>(
        &self,
        key: &str,
        ttl: Duration,
        f: F,
    ) -> Result<Option<T>, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let Some(lock) = self.acquire(key, ttl, 0, Duration::ZERO).await? else {
            return Ok(None);
        };
        let out = f().await;
        self.release(lock).await?;
        Ok(Some(out))
    }

    fn spawn_renewal(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
        lost: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        let backend = self.backend.clone();
        let key = key.to_string();
        let token = token.to_string();
        let period = ttl / 2;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
            ticker.tick().await; // first tick is immediate
            loop {
                ticker.tick().await;
                match backend.extend(&key, &token, ttl).await {
                    Ok(true) => {},
                    Ok(false) => {
                        warn!(key = %key, "lease no longer ours, stopping renewal");
                        lost.store(true, Ordering::SeqCst);
                        break;
                    },
                    Err(e) => {
                        // Transient backend trouble: keep trying until the
                        // TTL decides.
                        warn!(key = %key, error = %e, "lease renewal failed");
                    },
                }
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::InMemoryLockBackend;

    fn manager(node: &str) -> LockManager {
        LockManager::new(Arc::new(InMemoryLockBackend::new()), node)
    }

    #[tokio::test]
    async fn test_acquire_release_cycle() {
        let mgr = manager("node-a");
        let lock = mgr
            .acquire("import-job:1", Duration::from_secs(5), 0, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert!(mgr.is_locked("import-job:1").await.unwrap());
        assert!(lock.token().starts_with("node-a:"));
        assert!(mgr.release(lock).await.unwrap());
        assert!(!mgr.is_locked("import-job:1").await.unwrap());
    }

    #[tokio::test]
    async fn test_contention_single_winner() {
        let backend: Arc<dyn LockBackend> = Arc::new(InMemoryLockBackend::new());
        let a = LockManager::new(backend.clone(), "node-a");
        let b = LockManager::new(backend, "node-b");

        let (ra, rb) = tokio::join!(
            a.acquire("import-job:x", Duration::from_secs(5), 0, Duration::ZERO),
            b.acquire("import-job:x", Duration::from_secs(5), 0, Duration::ZERO),
        );
        let ra = ra.unwrap();
        let rb = rb.unwrap();
        assert!(ra.is_some() ^ rb.is_some(), "exactly one node wins");

        // Loser succeeds once the winner releases.
        if let Some(lock) = ra {
            a.release(lock).await.unwrap();
            assert!(b
                .acquire("import-job:x", Duration::from_secs(5), 0, Duration::ZERO)
                .await
                .unwrap()
                .is_some());
        } else if let Some(lock) = rb {
            b.release(lock).await.unwrap();
            assert!(a
                .acquire("import-job:x", Duration::from_secs(5), 0, Duration::ZERO)
                .await
                .unwrap()
                .is_some());
        }
    }

    #[tokio::test]
    async fn test_same_process_reentry_refused() {
        let mgr = manager("node-a");
        let lock = mgr
            .acquire("k", Duration::from_secs(5), 0, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert!(mgr
            .acquire("k", Duration::from_secs(5), 0, Duration::ZERO)
            .await
            .unwrap()
            .is_none());
        mgr.release(lock).await.unwrap();
        // Released: the key is acquirable again in-process.
        assert!(mgr
            .acquire("k", Duration::from_secs(5), 0, Duration::ZERO)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_renewal_outlives_initial_ttl() {
        let mgr = manager("node-a");
        let lock = mgr
            .acquire("k", Duration::from_millis(100), 0, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(mgr.is_locked("k").await.unwrap(), "renewal kept the lease");
        assert!(!lock.is_lost());
        mgr.release(lock).await.unwrap();
    }

    #[tokio::test]
    async fn test_lost_lease_is_flagged() {
        let backend = Arc::new(InMemoryLockBackend::new());
        let mgr = LockManager::new(backend.clone(), "node-a");
        let lock = mgr
            .acquire("k", Duration::from_millis(100), 0, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        // Steal the key out from under the renewer.
        backend.release("k", lock.token()).await.unwrap();
        backend
            .try_acquire("k", "node-b:steal", Duration::from_secs(5))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(lock.is_lost());
        // Release no-ops against the foreign token.
        assert!(!mgr.release(lock).await.unwrap());
    }

    #[tokio::test]
    async fn test_with_lock_runs_and_releases() {
        let mgr = manager("node-a");
        let ran = mgr
            .with_lock("k", Duration::from_secs(5), || async { 42 })
            .await
            .unwrap();
        assert_eq!(ran, Some(42));
        assert!(!mgr.is_locked("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_with_lock_skips_when_held() {
        let backend: Arc<dyn LockBackend> = Arc::new(InMemoryLockBackend::new());
        let a = LockManager::new(backend.clone(), "node-a");
        let b = LockManager::new(backend, "node-b");
        let _held = a
            .acquire("k", Duration::from_secs(5), 0, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        let skipped = b
            .with_lock("k", Duration::from_secs(5), || async { 42 })
            .await
            .unwrap();
        assert_eq!(skipped, None);
    }

    #[tokio::test]
    async fn test_acquire_with_retries_wins_after_release() {
        let backend: Arc<dyn LockBackend> = Arc::new(InMemoryLockBackend::new());
        let a = LockManager::new(backend.clone(), "node-a");
        let b = LockManager::new(backend, "node-b");
        let lock = a
            .acquire("k", Duration::from_secs(5), 0, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();

        let waiter = tokio::spawn(async move {
            b.acquire("k", Duration::from_secs(5), 5, Duration::from_millis(50))
                .await
        });
        tokio::time::sleep(Duration::from_millis(120)).await;
        a.release(lock).await.unwrap();

        let won = waiter.await.unwrap().unwrap();
        assert!(won.is_some(), "retry picked the lease up after release");
    }
}
