//! Document service

use crate::jobs::{namespace_for, CompactionOutcome, JobCounters, JobStats, Jobs};
use crate::{ServiceConfig, MAX_TITLE_LEN};
use scribe_cache::{DistributedLock, KvStore, Namespace, VersionedCache};
use scribe_core::{
    Collaborator, CompactionPolicy, Document, DocumentId, DocumentPage, Error, MaterializedState,
    PermissionChange, Result, Role, SnapshotOutcome, UserId,
};
use scribe_storage::{DocumentStore, StorageError};
use scribe_sync::SyncClient;
use scribe_worker::{SubmitOutcome, WorkerPool};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

const DEFAULT_PER_PAGE: u32 = 10;
const MAX_PER_PAGE: u32 = 100;

/// A document as seen by one user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentView {
    #[serde(flatten)]
    pub document: Document,
    pub role: Role,
}

/// Clamp listing parameters: page below 1 becomes 1, per-page outside 1..=100 becomes 10
fn normalize_page(page: u32, per_page: u32) -> (u32, u32) {
    let page = page.max(1);
    let per_page = if (1..=MAX_PER_PAGE).contains(&per_page) {
        per_page
    } else {
        DEFAULT_PER_PAGE
    };
    (page, per_page)
}

fn validate_title(title: &str) -> Result<String> {
    let title = title.trim();
    if title.is_empty() {
        return Err(Error::InvalidInput("title must not be empty".into()));
    }
    if title.chars().count() > MAX_TITLE_LEN {
        return Err(Error::InvalidInput(format!(
            "title must be at most {MAX_TITLE_LEN} characters"
        )));
    }
    Ok(title.to_string())
}

/// Entry point for every document operation
///
/// Foreground calls do their storage work inline and push slow follow-up work
/// (compaction, cache invalidation, sync notifications) onto the worker pool.
pub struct DocumentService {
    store: Arc<dyn DocumentStore>,
    cache: VersionedCache,
    pool: Arc<WorkerPool>,
    jobs: Arc<Jobs>,
    policy: CompactionPolicy,
    config: ServiceConfig,
}

impl DocumentService {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        kv: Arc<dyn KvStore>,
        sync: Arc<dyn SyncClient>,
        pool: Arc<WorkerPool>,
        config: ServiceConfig,
    ) -> Result<Self> {
        let policy = CompactionPolicy::new(config.compaction_threshold)?;
        let cache = VersionedCache::with_version_ttl(kv.clone(), config.version_ttl);
        let lock = DistributedLock::new(kv);

        let jobs = Arc::new(Jobs {
            store: store.clone(),
            cache: cache.clone(),
            lock,
            sync,
            policy,
            config: config.clone(),
            counters: JobCounters::default(),
        });

        Ok(Self {
            store,
            cache,
            pool,
            jobs,
            policy,
            config,
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn job_stats(&self) -> JobStats {
        self.jobs.counters.snapshot()
    }

    // ----- documents -----

    pub async fn create_document(&self, owner: UserId, title: &str) -> Result<Document> {
        let title = validate_title(title)?;
        let document = self.store.create_document(owner, &title).await?;

        if let Err(e) = self.cache.increment_version(&Namespace::Owned(owner)).await {
            warn!(user_id = %owner, error = %e, "Failed to invalidate owned listing");
        }

        info!(document_id = %document.id, owner_id = %owner, "Document created");
        Ok(document)
    }

    pub async fn rename_document(
        &self,
        doc: DocumentId,
        requester: UserId,
        title: &str,
    ) -> Result<Document> {
        let title = validate_title(title)?;
        let role = self.require_role(doc, requester).await?;
        if !role.can_write() {
            return Err(Error::Forbidden(format!("{role} cannot rename document {doc}")));
        }

        let document = self.store.rename_document(doc, &title).await?;
        self.submit_invalidation(doc, false);
        Ok(document)
    }

    /// Owner only. Former collaborators and the sync service are notified in the background.
    pub async fn delete_document(&self, doc: DocumentId, requester: UserId) -> Result<()> {
        let role = self.require_role(doc, requester).await?;
        if !role.can_manage() {
            return Err(Error::Forbidden(format!("only the owner can delete document {doc}")));
        }

        let namespaces: Vec<Namespace> = self
            .store
            .list_collaborators(doc)
            .await?
            .iter()
            .map(namespace_for)
            .collect();

        if !self.store.delete_document(doc).await? {
            return Err(Error::document_not_found(doc));
        }
        info!(document_id = %doc, "Document deleted");

        let jobs = self.jobs.clone();
        self.submit(format!("notify-removal:{doc}"), async move {
            jobs.notify_removal(doc, &namespaces).await
        });
        Ok(())
    }

    /// `Forbidden` unless `user` collaborates on the document
    pub async fn get_document(&self, doc: DocumentId, user: UserId) -> Result<DocumentView> {
        let document = self
            .store
            .find_document(doc)
            .await?
            .ok_or_else(|| Error::document_not_found(doc))?;

        let role = self
            .store
            .role_of(doc, user)
            .await?
            .ok_or_else(|| Error::Forbidden(format!("user {user} has no access to document {doc}")))?;

        Ok(DocumentView { document, role })
    }

    pub async fn user_role(&self, doc: DocumentId, user: UserId) -> Result<Option<Role>> {
        Ok(self.store.role_of(doc, user).await?)
    }

    // ----- update log -----

    /// Append an update fragment and schedule follow-up work
    pub async fn append_update(
        &self,
        doc: DocumentId,
        author: UserId,
        payload: &[u8],
    ) -> Result<u64> {
        if payload.is_empty() {
            return Err(Error::InvalidInput("update payload must not be empty".into()));
        }

        let role = self.require_role(doc, author).await?;
        if !role.can_write() {
            return Err(Error::Forbidden(format!("{role} cannot write to document {doc}")));
        }

        let seq = self.store.append_update(doc, author, payload).await?;
        debug!(document_id = %doc, seq, bytes = payload.len(), "Update appended");

        self.handle_update_accepted(doc, seq).await;
        Ok(seq)
    }

    /// Schedule the throttled invalidation and, when due, a compaction
    ///
    /// Never fails: problems reading the policy inputs only skip compaction.
    pub async fn handle_update_accepted(&self, doc: DocumentId, current_seq: u64) {
        self.submit_invalidation(doc, true);

        let last = match self.store.last_snapshot_seq(doc).await {
            Ok(last) => last,
            Err(e) => {
                warn!(document_id = %doc, error = %e, "Could not read snapshot seq, skipping compaction check");
                return;
            }
        };

        if self.policy.should_compact(last, current_seq) {
            debug!(document_id = %doc, last, current = current_seq, "Compaction due");
            let jobs = self.jobs.clone();
            self.submit(format!("compact:{doc}"), async move {
                jobs.compact_document(doc).await.map(|_| ())
            });
        }
    }

    /// Run a compaction inline, bypassing the pool
    ///
    /// Takes the same lock as the background job, so it is safe to call while
    /// the daemon is serving the document.
    pub async fn compact_now(&self, doc: DocumentId) -> anyhow::Result<CompactionOutcome> {
        self.jobs.compact_document(doc).await
    }

    /// Store a snapshot pushed by the sync service at the current seq
    pub async fn store_snapshot(&self, doc: DocumentId, payload: &[u8]) -> Result<SnapshotOutcome> {
        if payload.is_empty() {
            return Err(Error::InvalidInput("snapshot payload must not be empty".into()));
        }

        let seq = self.store.current_seq(doc).await?;
        let outcome = tokio::time::timeout(
            self.config.transaction_timeout,
            self.store.create_snapshot_if_absent(doc, seq, payload),
        )
        .await
        .map_err(|_| Error::Timeout(format!("snapshot transaction for document {doc}")))??;

        debug!(document_id = %doc, seq, ?outcome, "Snapshot stored");
        Ok(outcome)
    }

    /// Latest snapshot plus every update after it
    pub async fn document_state(&self, doc: DocumentId) -> Result<MaterializedState> {
        Ok(self
            .store
            .materialized_state(doc, self.config.update_page_size)
            .await?)
    }

    // ----- listings -----

    pub async fn list_owned_documents(
        &self,
        user: UserId,
        page: u32,
        per_page: u32,
    ) -> Result<DocumentPage> {
        let (page, per_page) = normalize_page(page, per_page);
        self.cached_page(Namespace::Owned(user), page, per_page, || {
            self.store.list_owned_documents(user, page, per_page)
        })
        .await
    }

    pub async fn list_shared_documents(
        &self,
        user: UserId,
        page: u32,
        per_page: u32,
    ) -> Result<DocumentPage> {
        let (page, per_page) = normalize_page(page, per_page);
        self.cached_page(Namespace::Shared(user), page, per_page, || {
            self.store.list_shared_documents(user, page, per_page)
        })
        .await
    }

    /// Read-through the versioned cache; cache trouble falls back to the store
    async fn cached_page<F, Fut>(
        &self,
        ns: Namespace,
        page: u32,
        per_page: u32,
        load: F,
    ) -> Result<DocumentPage>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<DocumentPage, StorageError>>,
    {
        // The version must be read before the store so a concurrent bump orphans this fill
        let key = match self.cache.get_version(&ns).await {
            Ok(version) => Some(VersionedCache::page_key(&ns, version, page, per_page)),
            Err(e) => {
                warn!(namespace = %ns, error = %e, "Cache unavailable, reading listing from store");
                None
            }
        };

        if let Some(key) = &key {
            match self.cache.get::<DocumentPage>(key).await {
                Ok(Some(hit)) => return Ok(hit),
                Ok(None) => {}
                Err(e) => warn!(key = %key, error = %e, "Cache read failed"),
            }
        }

        let fresh = load().await?;

        if let Some(key) = &key {
            if let Err(e) = self.cache.set(key, &fresh, self.config.list_cache_ttl).await {
                warn!(key = %key, error = %e, "Cache fill failed");
            }
        }
        Ok(fresh)
    }

    // ----- collaborators -----

    /// Viewers may not see the collaborator list
    pub async fn list_collaborators(
        &self,
        doc: DocumentId,
        requester: UserId,
    ) -> Result<Vec<Collaborator>> {
        let role = self.require_role(doc, requester).await?;
        if !role.can_list_collaborators() {
            return Err(Error::Forbidden(format!("{role} cannot list collaborators")));
        }
        Ok(self.store.list_collaborators(doc).await?)
    }

    pub async fn add_collaborator(
        &self,
        doc: DocumentId,
        requester: UserId,
        target: UserId,
        role: Role,
    ) -> Result<Collaborator> {
        self.require_manager(doc, requester, target, role).await?;

        let collaborator = self.store.add_collaborator(doc, target, role).await?;
        info!(document_id = %doc, user_id = %target, role = %role, "Collaborator added");

        self.submit_permission(doc, target, PermissionChange::granted(role));
        Ok(collaborator)
    }

    pub async fn change_collaborator_role(
        &self,
        doc: DocumentId,
        requester: UserId,
        target: UserId,
        role: Role,
    ) -> Result<()> {
        self.require_manager(doc, requester, target, role).await?;

        let current = self.require_collaborator(doc, target).await?;
        if current == role {
            return Err(Error::InvalidInput(format!("user {target} is already {role}")));
        }

        self.store.update_collaborator_role(doc, target, role).await?;
        info!(document_id = %doc, user_id = %target, from = %current, to = %role, "Collaborator role changed");

        self.submit_permission(doc, target, PermissionChange::granted(role));
        Ok(())
    }

    pub async fn remove_collaborator(
        &self,
        doc: DocumentId,
        requester: UserId,
        target: UserId,
    ) -> Result<()> {
        self.require_owner(doc, requester, target).await?;
        self.require_collaborator(doc, target).await?;

        self.store.remove_collaborator(doc, target).await?;
        info!(document_id = %doc, user_id = %target, "Collaborator removed");

        self.submit_permission(doc, target, PermissionChange::revoked());
        Ok(())
    }

    // ----- guards -----

    /// Requester's role; `NotFound` for unknown documents, `Forbidden` for strangers
    async fn require_role(&self, doc: DocumentId, user: UserId) -> Result<Role> {
        if let Some(role) = self.store.role_of(doc, user).await? {
            return Ok(role);
        }
        if self.store.find_document(doc).await?.is_none() {
            return Err(Error::document_not_found(doc));
        }
        Err(Error::Forbidden(format!(
            "user {user} has no access to document {doc}"
        )))
    }

    async fn require_owner(&self, doc: DocumentId, requester: UserId, target: UserId) -> Result<()> {
        let role = self.require_role(doc, requester).await?;
        if !role.can_manage() {
            return Err(Error::Forbidden("only the owner can manage collaborators".into()));
        }
        if requester == target {
            return Err(Error::InvalidInput("cannot change your own access".into()));
        }
        Ok(())
    }

    async fn require_manager(
        &self,
        doc: DocumentId,
        requester: UserId,
        target: UserId,
        role: Role,
    ) -> Result<()> {
        self.require_owner(doc, requester, target).await?;
        if !role.is_grantable() {
            return Err(Error::InvalidInput(format!("role {role} cannot be granted")));
        }
        Ok(())
    }

    async fn require_collaborator(&self, doc: DocumentId, user: UserId) -> Result<Role> {
        self.store
            .role_of(doc, user)
            .await?
            .ok_or_else(|| Error::InvalidInput(format!("user {user} is not a collaborator")))
    }

    // ----- background submission -----

    fn submit<Fut>(&self, name: String, job: Fut) -> SubmitOutcome
    where
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let jobs = self.jobs.clone();
        self.pool.submit(name, move |ctx| async move {
            let result = job.await;
            if let Err(e) = &result {
                jobs.counters.record_failure();
                warn!(task = ctx.name(), error = %format!("{e:#}"), "Background job failed");
            }
            // Already logged with its chain; reported to the pool as success
            Ok(())
        })
    }

    fn submit_invalidation(&self, doc: DocumentId, cooldown: bool) {
        let jobs = self.jobs.clone();
        self.submit(format!("invalidate:{doc}"), async move {
            jobs.invalidate_collaborators(doc, cooldown).await.map(|_| ())
        });
    }

    fn submit_permission(&self, doc: DocumentId, user: UserId, change: PermissionChange) {
        let jobs = self.jobs.clone();
        self.submit(format!("notify-permission:{doc}:{user}"), async move {
            jobs.notify_permission(doc, user, change).await
        });
    }
}
