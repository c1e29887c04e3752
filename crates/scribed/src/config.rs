//! Configuration file
//!
//! Every section is optional; missing keys take the defaults below and
//! command-line flags override whatever the file says.
//!
//! ```toml
//! [storage]
//! backend = "sqlite"
//! path = "/var/lib/scribe/scribe.db"
//!
//! [cache]
//! backend = "redis"
//! url = "redis://127.0.0.1:6379"
//!
//! [sync]
//! base_url = "http://localhost:8787"
//! secret = "change-me"
//!
//! [worker]
//! workers = 4
//!
//! [service]
//! compaction_threshold = 200
//! ```

use anyhow::{Context, Result};
use clap::ValueEnum;
use scribe_service::ServiceConfig;
use scribe_sync::SyncConfig;
use scribe_worker::{PoolConfig, DEFAULT_QUEUE_CAPACITY};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Sqlite,
    Postgres,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    Memory,
    Redis,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub backend: StorageBackend,
    /// SQLite database file
    pub path: PathBuf,
    /// Postgres connection string
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            path: PathBuf::from("scribe.db"),
            url: None,
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub backend: CacheBackend,
    pub url: String,
    /// Per-command bound on Redis round trips
    pub op_timeout_ms: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            backend: CacheBackend::Memory,
            url: "redis://127.0.0.1:6379".to_string(),
            op_timeout_ms: 500,
        }
    }
}

impl CacheSection {
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSection {
    pub base_url: String,
    pub secret: String,
    pub timeout_secs: u64,
}

impl Default for SyncSection {
    fn default() -> Self {
        let defaults = SyncConfig::default();
        Self {
            base_url: defaults.base_url,
            secret: defaults.secret,
            timeout_secs: defaults.timeout.as_secs(),
        }
    }
}

impl SyncSection {
    pub fn to_sync_config(&self) -> SyncConfig {
        SyncConfig {
            base_url: self.base_url.clone(),
            secret: self.secret.clone(),
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    pub workers: usize,
    pub queue_capacity: usize,
    pub task_timeout_secs: u64,
}

impl Default for WorkerSection {
    fn default() -> Self {
        let defaults = PoolConfig::default();
        Self {
            workers: defaults.workers,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            task_timeout_secs: defaults.task_timeout.as_secs(),
        }
    }
}

impl WorkerSection {
    pub fn to_pool_config(&self) -> PoolConfig {
        PoolConfig {
            workers: self.workers,
            queue_capacity: self.queue_capacity,
            task_timeout: Duration::from_secs(self.task_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub storage: StorageSection,
    pub cache: CacheSection,
    pub sync: SyncSection,
    pub worker: WorkerSection,
    pub service: ServiceConfig,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }
}
