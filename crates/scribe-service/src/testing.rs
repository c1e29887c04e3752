//! Fakes and wiring shared by the service tests

use crate::jobs::{JobCounters, Jobs};
use crate::{DocumentService, ServiceConfig};
use async_trait::async_trait;
use scribe_cache::{DistributedLock, KvStore, MemoryKv, VersionedCache};
use scribe_core::{CompactionPolicy, DocumentId, PermissionChange, UserId};
use scribe_storage::{DocumentStore, MemoryStore};
use scribe_sync::{SyncClient, SyncError};
use scribe_worker::{PoolConfig, WorkerPool};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const MERGED_STATE: &[u8] = b"merged-state";

/// Sync service stand-in recording every call
#[derive(Default)]
pub struct FakeSync {
    delay: Option<Duration>,
    fail_status: Mutex<Option<u16>>,
    state_fetches: AtomicUsize,
    permissions: Mutex<Vec<(DocumentId, UserId, String)>>,
    removals: Mutex<Vec<DocumentId>>,
}

impl FakeSync {
    /// Every state fetch takes `delay`
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn fail_with_status(&self, status: u16) {
        *self.fail_status.lock().unwrap() = Some(status);
    }

    pub fn recover(&self) {
        *self.fail_status.lock().unwrap() = None;
    }

    pub fn state_fetches(&self) -> usize {
        self.state_fetches.load(Ordering::SeqCst)
    }

    pub fn permission_calls(&self) -> Vec<(DocumentId, UserId, String)> {
        self.permissions.lock().unwrap().clone()
    }

    pub fn removals(&self) -> Vec<DocumentId> {
        self.removals.lock().unwrap().clone()
    }

    fn check(&self) -> Result<(), SyncError> {
        match *self.fail_status.lock().unwrap() {
            Some(status) => Err(SyncError::Status {
                status,
                body: "unavailable".to_string(),
            }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl SyncClient for FakeSync {
    async fn fetch_document_state(&self, _doc: DocumentId) -> Result<Vec<u8>, SyncError> {
        self.state_fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.check()?;
        Ok(MERGED_STATE.to_vec())
    }

    async fn update_user_permission(
        &self,
        doc: DocumentId,
        user: UserId,
        change: PermissionChange,
    ) -> Result<(), SyncError> {
        self.check()?;
        self.permissions
            .lock()
            .unwrap()
            .push((doc, user, change.as_str().to_string()));
        Ok(())
    }

    async fn remove_document(&self, doc: DocumentId) -> Result<(), SyncError> {
        self.check()?;
        self.removals.lock().unwrap().push(doc);
        Ok(())
    }
}

/// Memory-backed dependencies wired the way the daemon wires real ones
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub kv: Arc<MemoryKv>,
    pub cache: VersionedCache,
    pub lock: DistributedLock,
    pub sync: Arc<FakeSync>,
    pub config: ServiceConfig,
    jobs: Arc<Jobs>,
}

impl Harness {
    pub fn with_threshold(threshold: u64) -> Self {
        Self::with_sync(threshold, FakeSync::default())
    }

    pub fn with_sync(threshold: u64, sync: FakeSync) -> Self {
        let config = ServiceConfig {
            compaction_threshold: threshold,
            ..ServiceConfig::default()
        };
        let store = Arc::new(MemoryStore::new());
        let kv = Arc::new(MemoryKv::new());
        let cache = VersionedCache::new(kv.clone());
        let lock = DistributedLock::new(kv.clone());
        let sync = Arc::new(sync);

        let jobs = Arc::new(Jobs {
            store: store.clone(),
            cache: cache.clone(),
            lock: lock.clone(),
            sync: sync.clone(),
            policy: CompactionPolicy::new(threshold).unwrap(),
            config: config.clone(),
            counters: JobCounters::default(),
        });

        Self {
            store,
            kv,
            cache,
            lock,
            sync,
            config,
            jobs,
        }
    }

    pub fn jobs(&self) -> &Jobs {
        &self.jobs
    }

    pub fn jobs_arc(&self) -> Arc<Jobs> {
        self.jobs.clone()
    }

    /// A document owned by user 1
    pub async fn document(&self) -> DocumentId {
        self.store
            .create_document(UserId(1), "notes")
            .await
            .unwrap()
            .id
    }

    /// A service over the same store, cache and sync fake, with its own pool
    pub fn service(&self) -> (DocumentService, Arc<WorkerPool>) {
        let pool = Arc::new(WorkerPool::new(PoolConfig {
            workers: 2,
            queue_capacity: 64,
            task_timeout: Duration::from_secs(5),
        }));
        let service = DocumentService::new(
            self.store.clone() as Arc<dyn DocumentStore>,
            self.kv.clone() as Arc<dyn KvStore>,
            self.sync.clone() as Arc<dyn SyncClient>,
            pool.clone(),
            self.config.clone(),
        )
        .unwrap();
        (service, pool)
    }
}
