//! Redis-backed lock storage
//!
//! Acquisition uses atomic `SET key token NX PX ttl`; extension and release
//! go through Lua scripts so the stored token is compared and acted on in a
//! single server-side step. A simplified single-instance Redlock.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, RedisError, Script};

use crate::backend::LockBackend;
use crate::LockError;

/// Only deletes the key if the stored value matches the token.
const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// Only extends the TTL if the stored value matches the token.
const EXTEND_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("pexpire", KEYS[1], ARGV[2])
else
    return 0
end
"#;

#[derive(Clone)]
pub struct RedisLockBackend {
    conn: MultiplexedConnection,
    key_prefix: String,
}

impl RedisLockBackend {
    /// Connect to Redis at `url` (e.g. "redis://127.0.0.1:6379").
    pub async fn new(url: &str) -> Result<Self, LockError> {
        let client = Client::open(url).map_err(map_redis_error)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(map_redis_error)?;
        Ok(Self::from_connection(conn))
    }

    /// Wrap an existing multiplexed connection.
    pub fn from_connection(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            key_prefix: "bulkport:lock".to_string(),
        }
    }

    /// Override the key prefix (default `bulkport:lock`).
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    fn lock_key(&self, key: &str) -> String {
        format_lock_key(&self.key_prefix, key)
    }
}

/// Format a prefixed lock key (split out so it is testable without a
/// Redis connection).
pub fn format_lock_key(prefix: &str, key: &str) -> String {
    format!("{}:{}", prefix, key)
}

#[async_trait]
impl LockBackend for RedisLockBackend {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let full_key = self.lock_key(key);

        // Atomic SET key token NX PX millis
        let result: Option<String> = redis::cmd("SET")
            .arg(&full_key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        Ok(result.is_some())
    }

    async fn extend(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let full_key = self.lock_key(key);

        let result: i64 = Script::new(EXTEND_SCRIPT)
            .key(&full_key)
            .arg(token)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        Ok(result == 1)
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let full_key = self.lock_key(key);

        let result: i64 = Script::new(RELEASE_SCRIPT)
            .key(&full_key)
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        Ok(result == 1)
    }

    async fn holder(&self, key: &str) -> Result<Option<String>, LockError> {
        let mut conn = self.conn.clone();
        let full_key = self.lock_key(key);
        let token: Option<String> = conn.get(&full_key).await.map_err(map_redis_error)?;
        Ok(token)
    }
}

fn map_redis_error(err: RedisError) -> LockError {
    LockError::Backend(err.to_string())
}
