use async_trait::async_trait;
use std::time::Duration;

use crate::LockError;

/// Storage primitive behind the lock manager.
///
/// Every operation is atomic with respect to the stored token: acquisition is
/// a set-if-absent, extension and release compare the stored value against
/// the caller's token before acting. A `false` return means the caller does
/// not (or no longer does) own the key.
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Set `key = token` with expiry `ttl` only if the key is absent.
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError>;

    /// Push the expiry out to `ttl` from now, only if `key` still holds `token`.
    async fn extend(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError>;

    /// Delete the key, only if it still holds `token`.
    async fn release(&self, key: &str, token: &str) -> Result<bool, LockError>;

    /// Current token stored under `key`, if any non-expired holder exists.
    async fn holder(&self, key: &str) -> Result<Option<String>, LockError>;
}
