//! Distributed lock over a [`KvStore`]

use crate::{CacheError, KvStore};
use scribe_core::DocumentId;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Lock keys used by the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKey {
    /// Held while a compaction job snapshots a document
    Snapshot(DocumentId),
    /// Held for the cooldown window after a collaborator invalidation
    InvalidationCooldown(DocumentId),
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockKey::Snapshot(doc) => write!(f, "lock:snapshot:{doc}"),
            LockKey::InvalidationCooldown(doc) => write!(f, "invalidation_cooldown:d:{doc}"),
        }
    }
}

/// Proof of a successful acquisition
///
/// Carries the holder token written into the lock entry. Dropping a lease does
/// not release the lock; call [`DistributedLock::release`] or let the TTL lapse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    key: LockKey,
    token: String,
}

impl LockLease {
    pub fn key(&self) -> LockKey {
        self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

/// TTL-bounded mutual exclusion
///
/// Acquisition is a single `SET NX` with expiry, so a crashed holder blocks the
/// key for at most its TTL. Every acquisition writes a fresh token and release
/// is compare-and-delete, so a holder whose lease already expired can never
/// remove a lock that was re-acquired by someone else.
#[derive(Clone)]
pub struct DistributedLock {
    kv: Arc<dyn KvStore>,
}

impl DistributedLock {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Try to take `key` for `ttl`. `None` when someone else holds it.
    pub async fn try_acquire(
        &self,
        key: &LockKey,
        ttl: Duration,
    ) -> Result<Option<LockLease>, CacheError> {
        let token = Uuid::new_v4().to_string();
        let acquired = self
            .kv
            .set_nx(&key.to_string(), token.as_bytes(), ttl)
            .await?;

        if acquired {
            debug!(key = %key, ttl_ms = ttl.as_millis() as u64, "Lock acquired");
            Ok(Some(LockLease { key: *key, token }))
        } else {
            debug!(key = %key, "Lock busy");
            Ok(None)
        }
    }

    /// Release a lease. Returns false if it had already expired or been taken over.
    pub async fn release(&self, lease: &LockLease) -> Result<bool, CacheError> {
        let released = self
            .kv
            .del_if_eq(&lease.key.to_string(), lease.token.as_bytes())
            .await?;

        if !released {
            warn!(key = %lease.key, "Lock lease lapsed before release");
        }
        Ok(released)
    }
}
