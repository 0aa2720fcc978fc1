//! Cluster-wide advisory locks for bulkport
//!
//! A lock is a token-holding claim on a named resource with an explicit
//! expiry. Ownership is decided by a single atomic compare-and-set on the
//! backend; a lock held by a crashed process expires on its own after the
//! TTL. The [`LockManager`] layers node identity, retry, background renewal
//! and a process-wide held-key guard on top of a pluggable [`LockBackend`].

pub mod backend;
pub mod error;
pub mod manager;
pub mod memory;
pub mod redis;

pub use backend::LockBackend;
pub use error::LockError;
pub use manager::{Lock, LockManager};
pub use memory::InMemoryLockBackend;
pub use self::redis::RedisLockBackend;
