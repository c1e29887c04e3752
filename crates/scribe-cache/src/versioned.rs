//! Namespace-versioned read-through cache
//!
//! Listings are cached under keys that embed the namespace's current version.
//! Invalidating a namespace is a single `INCR` of its version counter: every key
//! built from an older version becomes unreachable and ages out on its own TTL,
//! so no key scan or bulk delete is ever needed.

use crate::{CacheError, KvStore};
use scribe_core::UserId;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default lifetime of a namespace version counter
pub const DEFAULT_VERSION_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Cache namespaces, one version counter each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// Documents owned by a user
    Owned(UserId),
    /// Documents shared with a user
    Shared(UserId),
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Namespace::Owned(user) => write!(f, "docs:owned:{user}"),
            Namespace::Shared(user) => write!(f, "docs:shared:{user}"),
        }
    }
}

/// JSON cache with per-namespace version counters
#[derive(Clone)]
pub struct VersionedCache {
    kv: Arc<dyn KvStore>,
    version_ttl: Duration,
}

impl VersionedCache {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self::with_version_ttl(kv, DEFAULT_VERSION_TTL)
    }

    pub fn with_version_ttl(kv: Arc<dyn KvStore>, version_ttl: Duration) -> Self {
        Self { kv, version_ttl }
    }

    fn version_key(ns: &Namespace) -> String {
        format!("{ns}:version")
    }

    /// Key for one cached page of a namespace at a given version
    pub fn page_key(ns: &Namespace, version: u64, page: u32, per_page: u32) -> String {
        format!("{ns}:v{version}:page:{page}:per:{per_page}")
    }

    /// Read and decode a cached value
    ///
    /// A value that no longer decodes is treated as a miss.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        let Some(raw) = self.kv.get(key).await? else {
            return Ok(None);
        };

        match serde_json::from_slice(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(key = %key, error = %e, "Discarding undecodable cache entry");
                Ok(None)
            }
        }
    }

    /// Encode and store a value with a TTL
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let raw = serde_json::to_vec(value)?;
        self.kv.set(key, &raw, ttl).await
    }

    /// Store only if absent. Returns true if this call created the entry.
    pub async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, CacheError> {
        self.kv.set_nx(key, value, ttl).await
    }

    /// Current version of a namespace, 0 if it was never bumped
    pub async fn get_version(&self, ns: &Namespace) -> Result<u64, CacheError> {
        let key = Self::version_key(ns);
        let Some(raw) = self.kv.get(&key).await? else {
            return Ok(0);
        };

        std::str::from_utf8(&raw)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| CacheError::Backend(format!("version at {key} is not an integer")))
    }

    /// Bump a namespace version, orphaning every page cached under the old one
    pub async fn increment_version(&self, ns: &Namespace) -> Result<u64, CacheError> {
        let key = Self::version_key(ns);
        let version = self.kv.incr(&key).await?;
        self.kv.expire(&key, self.version_ttl).await?;

        debug!(namespace = %ns, version, "Cache version bumped");
        Ok(version.max(0) as u64)
    }
}
