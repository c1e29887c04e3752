//! Cache layer for Scribe
//!
//! A small TTL key-value boundary ([`KvStore`]) with two consumers built on it:
//! [`DistributedLock`] for cross-instance mutual exclusion and cooldowns, and
//! [`VersionedCache`] for namespace-versioned read-through caching of listings.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// TTL key-value store
///
/// Mirrors the handful of Redis primitives the service relies on. Values are raw
/// bytes; counters are stored as decimal text so `incr` behaves like Redis.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Get a value, `None` when absent or expired
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// Set a value with an expiry, replacing any existing entry
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError>;

    /// Set only if the key is absent. Returns true if this call created the entry.
    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, CacheError>;

    /// Delete a key. Returns true if it existed.
    async fn del(&self, key: &str) -> Result<bool, CacheError>;

    /// Delete a key only while it still holds `expected`
    async fn del_if_eq(&self, key: &str, expected: &[u8]) -> Result<bool, CacheError>;

    /// Atomically increment an integer counter, creating it at 1
    async fn incr(&self, key: &str) -> Result<i64, CacheError>;

    /// Reset the expiry of an existing key. Returns false if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError>;
}

/// Cache errors
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache operation timed out: {0}")]
    Timeout(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}

impl From<CacheError> for scribe_core::Error {
    fn from(e: CacheError) -> Self {
        match e {
            CacheError::Timeout(msg) => scribe_core::Error::Timeout(msg),
            other => scribe_core::Error::Cache(other.to_string()),
        }
    }
}

pub mod lock;
pub mod versioned;

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

pub use lock::{DistributedLock, LockKey, LockLease};
pub use versioned::{Namespace, VersionedCache};

#[cfg(feature = "memory")]
pub use memory::MemoryKv;

#[cfg(feature = "redis")]
pub use self::redis::RedisKv;
