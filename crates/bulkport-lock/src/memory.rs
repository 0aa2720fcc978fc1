//! In-process lock storage
//!
//! Single-process stand-in for the Redis backend, used by tests and local
//! development. Expiry is checked lazily on access.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::backend::LockBackend;
use crate::LockError;

struct LockEntry {
    token: String,
    expires_at: Instant,
}

impl LockEntry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

#[derive(Default)]
pub struct InMemoryLockBackend {
    locks: Mutex<HashMap<String, LockEntry>>,
}

impl InMemoryLockBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockBackend for InMemoryLockBackend {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut locks = self.locks.lock().await;
        if let Some(entry) = locks.get(key) {
            if !entry.is_expired() {
                return Ok(false);
            }
        }
        locks.insert(
            key.to_string(),
            LockEntry {
                token: token.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(true)
    }

    async fn extend(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut locks = self.locks.lock().await;
        match locks.get_mut(key) {
            Some(entry) if entry.token == token && !entry.is_expired() => {
                entry.expires_at = Instant::now() + ttl;
                Ok(true)
            },
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool, LockError> {
        let mut locks = self.locks.lock().await;
        match locks.get(key) {
            Some(entry) if entry.token == token => {
                locks.remove(key);
                Ok(true)
            },
            _ => Ok(false),
        }
    }

    async fn holder(&self, key: &str) -> Result<Option<String>, LockError> {
        let locks = self.locks.lock().await;
        Ok(locks
            .get(key)
            .filter(|e| !e.is_expired())
            .map(|e| e.token.clone()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_and_release() {
        let be = InMemoryLockBackend::new();
        assert!(be.try_acquire("k", "t1", Duration::from_secs(10)).await.unwrap());
        assert_eq!(be.holder("k").await.unwrap().as_deref(), Some("t1"));
        assert!(be.release("k", "t1").await.unwrap());
        assert_eq!(be.holder("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_second_acquire_fails_while_held() {
        let be = InMemoryLockBackend::new();
        assert!(be.try_acquire("k", "t1", Duration::from_secs(10)).await.unwrap());
        assert!(!be.try_acquire("k", "t2", Duration::from_secs(10)).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_with_wrong_token_is_noop() {
        let be = InMemoryLockBackend::new();
        assert!(be.try_acquire("k", "t1", Duration::from_secs(10)).await.unwrap());
        assert!(!be.release("k", "imposter").await.unwrap());
        assert_eq!(be.holder("k").await.unwrap().as_deref(), Some("t1"));
    }

    #[tokio::test]
    async fn test_extend_requires_matching_token() {
        let be = InMemoryLockBackend::new();
        assert!(be.try_acquire("k", "t1", Duration::from_secs(10)).await.unwrap());
        assert!(be.extend("k", "t1", Duration::from_secs(60)).await.unwrap());
        assert!(!be.extend("k", "imposter", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn test_acquire_after_expiry() {
        let be = InMemoryLockBackend::new();
        assert!(be.try_acquire("k", "t1", Duration::from_millis(1)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(be.holder("k").await.unwrap(), None);
        assert!(be.try_acquire("k", "t2", Duration::from_secs(10)).await.unwrap());
    }
}
