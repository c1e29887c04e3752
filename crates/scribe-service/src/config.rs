//! Service configuration

use scribe_core::DEFAULT_COMPACTION_THRESHOLD;
use scribe_storage::UPDATE_PAGE_SIZE;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Longest accepted document title, in characters
pub const MAX_TITLE_LEN: usize = 255;

/// Tunables for [`crate::DocumentService`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Updates since the last snapshot that make a document due for compaction
    pub compaction_threshold: u64,
    /// Page size used when draining the update log
    pub update_page_size: usize,
    /// Expiry of the per-document compaction lock
    #[serde(with = "secs")]
    pub snapshot_lock_ttl: Duration,
    /// Minimum gap between two collaborator invalidations of one document
    #[serde(with = "secs")]
    pub invalidation_cooldown: Duration,
    /// Lifetime of a cached listing page
    #[serde(with = "secs")]
    pub list_cache_ttl: Duration,
    /// Lifetime of a namespace version counter, refreshed on every bump
    #[serde(with = "secs")]
    pub version_ttl: Duration,
    /// Upper bound on a snapshot write transaction
    #[serde(with = "secs")]
    pub transaction_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            compaction_threshold: DEFAULT_COMPACTION_THRESHOLD,
            update_page_size: UPDATE_PAGE_SIZE,
            snapshot_lock_ttl: Duration::from_secs(30),
            invalidation_cooldown: Duration::from_secs(60),
            list_cache_ttl: Duration::from_secs(5 * 60),
            version_ttl: scribe_cache::versioned::DEFAULT_VERSION_TTL,
            transaction_timeout: Duration::from_secs(3),
        }
    }
}

/// Durations as whole seconds in config files
mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
