//! Background jobs run on the worker pool

use crate::ServiceConfig;
use anyhow::{anyhow, Context};
use scribe_cache::{DistributedLock, LockKey, Namespace, VersionedCache};
use scribe_core::{
    CompactionPolicy, Collaborator, DocumentId, PermissionChange, Role, SnapshotOutcome, UserId,
};
use scribe_storage::DocumentStore;
use scribe_sync::SyncClient;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a compaction job ended up doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionOutcome {
    /// Another compactor holds the document's lock
    Locked,
    /// The log shrank below the threshold since the job was scheduled
    NotDue,
    Snapshotted(SnapshotOutcome),
}

/// What an invalidation job ended up doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationOutcome {
    /// Still inside the cooldown window of a previous invalidation
    Throttled,
    /// Number of namespace versions bumped
    Bumped(usize),
}

/// Counters for background job outcomes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobStats {
    pub snapshots_created: u64,
    pub snapshots_existing: u64,
    pub updates_pruned: u64,
    pub compactions_locked: u64,
    pub compactions_not_due: u64,
    pub invalidations: u64,
    pub invalidations_throttled: u64,
    pub versions_bumped: u64,
    pub notifications_sent: u64,
    pub job_failures: u64,
}

#[derive(Default)]
pub(crate) struct JobCounters {
    snapshots_created: AtomicU64,
    snapshots_existing: AtomicU64,
    updates_pruned: AtomicU64,
    compactions_locked: AtomicU64,
    compactions_not_due: AtomicU64,
    invalidations: AtomicU64,
    invalidations_throttled: AtomicU64,
    versions_bumped: AtomicU64,
    notifications_sent: AtomicU64,
    job_failures: AtomicU64,
}

fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

impl JobCounters {
    pub fn snapshot(&self) -> JobStats {
        JobStats {
            snapshots_created: self.snapshots_created.load(Ordering::Relaxed),
            snapshots_existing: self.snapshots_existing.load(Ordering::Relaxed),
            updates_pruned: self.updates_pruned.load(Ordering::Relaxed),
            compactions_locked: self.compactions_locked.load(Ordering::Relaxed),
            compactions_not_due: self.compactions_not_due.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            invalidations_throttled: self.invalidations_throttled.load(Ordering::Relaxed),
            versions_bumped: self.versions_bumped.load(Ordering::Relaxed),
            notifications_sent: self.notifications_sent.load(Ordering::Relaxed),
            job_failures: self.job_failures.load(Ordering::Relaxed),
        }
    }

    pub fn record_failure(&self) {
        add(&self.job_failures, 1);
    }
}

/// Listing namespace a collaborator's view of a document lives in
pub(crate) fn namespace_for(collaborator: &Collaborator) -> Namespace {
    match collaborator.role {
        Role::Owner => Namespace::Owned(collaborator.user_id),
        Role::Editor | Role::Viewer => Namespace::Shared(collaborator.user_id),
    }
}

/// Shared dependencies of every background job
pub(crate) struct Jobs {
    pub store: Arc<dyn DocumentStore>,
    pub cache: VersionedCache,
    pub lock: DistributedLock,
    pub sync: Arc<dyn SyncClient>,
    pub policy: CompactionPolicy,
    pub config: ServiceConfig,
    pub counters: JobCounters,
}

impl Jobs {
    /// Snapshot `doc` if it is still due, under the per-document lock
    pub async fn compact_document(&self, doc: DocumentId) -> anyhow::Result<CompactionOutcome> {
        let key = LockKey::Snapshot(doc);
        let Some(lease) = self
            .lock
            .try_acquire(&key, self.config.snapshot_lock_ttl)
            .await
            .context("acquiring snapshot lock")?
        else {
            add(&self.counters.compactions_locked, 1);
            debug!(document_id = %doc, "Compaction already in progress, skipping");
            return Ok(CompactionOutcome::Locked);
        };

        let result = self.compact_locked(doc).await;

        if let Err(e) = self.lock.release(&lease).await {
            // The lease still expires on its own
            warn!(document_id = %doc, error = %e, "Failed to release snapshot lock");
        }
        result
    }

    async fn compact_locked(&self, doc: DocumentId) -> anyhow::Result<CompactionOutcome> {
        // Another compactor may have finished while this job sat in the queue
        let last = self.store.last_snapshot_seq(doc).await?;
        let capture_seq = self.store.current_seq(doc).await?;
        if !self.policy.should_compact(last, capture_seq) {
            add(&self.counters.compactions_not_due, 1);
            debug!(document_id = %doc, last, current = capture_seq, "Compaction no longer due");
            return Ok(CompactionOutcome::NotDue);
        }

        // State fetched after reading capture_seq covers at least every update up to it
        let state = self
            .sync
            .fetch_document_state(doc)
            .await
            .context("fetching document state from sync service")?;

        let outcome = tokio::time::timeout(
            self.config.transaction_timeout,
            self.store.create_snapshot_if_absent(doc, capture_seq, &state),
        )
        .await
        .map_err(|_| anyhow!("snapshot transaction timed out"))??;

        match outcome {
            SnapshotOutcome::Created { seq, pruned } => {
                add(&self.counters.snapshots_created, 1);
                add(&self.counters.updates_pruned, pruned);
                info!(
                    document_id = %doc,
                    seq,
                    pruned,
                    bytes = state.len(),
                    "Snapshot created"
                );
            }
            SnapshotOutcome::AlreadyExists { seq } => {
                add(&self.counters.snapshots_existing, 1);
                debug!(document_id = %doc, seq, "Snapshot already present");
            }
        }

        Ok(CompactionOutcome::Snapshotted(outcome))
    }

    /// Bump the listing version of every collaborator of `doc`
    ///
    /// With `cooldown` set, at most one invalidation per document runs per
    /// cooldown window; the cooldown entry is left to expire, never released.
    pub async fn invalidate_collaborators(
        &self,
        doc: DocumentId,
        cooldown: bool,
    ) -> anyhow::Result<InvalidationOutcome> {
        if cooldown {
            let acquired = self
                .lock
                .try_acquire(
                    &LockKey::InvalidationCooldown(doc),
                    self.config.invalidation_cooldown,
                )
                .await
                .context("acquiring invalidation cooldown")?;
            if acquired.is_none() {
                add(&self.counters.invalidations_throttled, 1);
                return Ok(InvalidationOutcome::Throttled);
            }
        }

        let namespaces: Vec<Namespace> = self
            .store
            .list_collaborators(doc)
            .await?
            .iter()
            .map(namespace_for)
            .collect();

        let bumped = self.bump_versions(&namespaces).await?;
        add(&self.counters.invalidations, 1);
        debug!(document_id = %doc, bumped, "Collaborator listings invalidated");
        Ok(InvalidationOutcome::Bumped(bumped))
    }

    /// Bump each namespace, stopping at the first cache error
    pub async fn bump_versions(&self, namespaces: &[Namespace]) -> anyhow::Result<usize> {
        for ns in namespaces {
            self.cache
                .increment_version(ns)
                .await
                .with_context(|| format!("bumping {ns}"))?;
        }
        add(&self.counters.versions_bumped, namespaces.len() as u64);
        Ok(namespaces.len())
    }

    /// Refresh the target's shared listing, then tell the sync service
    pub async fn notify_permission(
        &self,
        doc: DocumentId,
        user: UserId,
        change: PermissionChange,
    ) -> anyhow::Result<()> {
        self.bump_versions(&[Namespace::Shared(user)]).await?;
        self.sync
            .update_user_permission(doc, user, change)
            .await
            .context("notifying sync service of permission change")?;

        add(&self.counters.notifications_sent, 1);
        info!(
            document_id = %doc,
            user_id = %user,
            role = change.as_str(),
            "Permission change propagated"
        );
        Ok(())
    }

    /// Refresh former collaborators' listings, then tell the sync service
    pub async fn notify_removal(
        &self,
        doc: DocumentId,
        namespaces: &[Namespace],
    ) -> anyhow::Result<()> {
        self.bump_versions(namespaces).await?;
        self.sync
            .remove_document(doc)
            .await
            .context("notifying sync service of document removal")?;

        add(&self.counters.notifications_sent, 1);
        info!(document_id = %doc, "Document removal propagated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeSync, Harness};
    use std::time::Duration;

    #[tokio::test]
    async fn test_compaction_not_due_below_threshold() {
        let h = Harness::with_threshold(5);
        let doc = h.document().await;
        for _ in 0..4 {
            h.store.append_update(doc, UserId(1), b"u").await.unwrap();
        }

        let outcome = h.jobs().compact_document(doc).await.unwrap();
        assert_eq!(outcome, CompactionOutcome::NotDue);
        assert_eq!(h.store.snapshot_count(doc), 0);
    }

    #[tokio::test]
    async fn test_compaction_snapshots_at_capture_seq() {
        let h = Harness::with_threshold(5);
        let doc = h.document().await;
        for _ in 0..7 {
            h.store.append_update(doc, UserId(1), b"u").await.unwrap();
        }

        let outcome = h.jobs().compact_document(doc).await.unwrap();
        assert_eq!(
            outcome,
            CompactionOutcome::Snapshotted(SnapshotOutcome::Created { seq: 7, pruned: 7 })
        );
        assert_eq!(h.store.update_count(doc), 0);

        // Lock was released
        let again = h.jobs().compact_document(doc).await.unwrap();
        assert_eq!(again, CompactionOutcome::NotDue);
    }

    #[tokio::test]
    async fn test_compaction_skips_when_locked() {
        let h = Harness::with_threshold(1);
        let doc = h.document().await;
        h.store.append_update(doc, UserId(1), b"u").await.unwrap();

        let held = h
            .lock
            .try_acquire(&LockKey::Snapshot(doc), Duration::from_secs(30))
            .await
            .unwrap();
        assert!(held.is_some());

        let outcome = h.jobs().compact_document(doc).await.unwrap();
        assert_eq!(outcome, CompactionOutcome::Locked);
        assert_eq!(h.sync.state_fetches(), 0);
    }

    #[tokio::test]
    async fn test_sync_failure_releases_lock() {
        let h = Harness::with_threshold(1);
        let doc = h.document().await;
        h.store.append_update(doc, UserId(1), b"u").await.unwrap();
        h.sync.fail_with_status(503);

        assert!(h.jobs().compact_document(doc).await.is_err());
        assert_eq!(h.store.snapshot_count(doc), 0);
        assert_eq!(h.store.update_count(doc), 1);

        // A later run is not blocked by a leaked lock
        h.sync.recover();
        let outcome = h.jobs().compact_document(doc).await.unwrap();
        assert!(matches!(outcome, CompactionOutcome::Snapshotted(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_compactors_single_snapshot() {
        let h = Harness::with_sync(2, FakeSync::slow(Duration::from_millis(100)));
        let doc = h.document().await;
        for _ in 0..3 {
            h.store.append_update(doc, UserId(1), b"u").await.unwrap();
        }

        let a = h.jobs_arc();
        let b = h.jobs_arc();
        let (first, second) = tokio::join!(
            tokio::spawn(async move { a.compact_document(doc).await.unwrap() }),
            tokio::spawn(async move { b.compact_document(doc).await.unwrap() }),
        );
        let mut outcomes = [first.unwrap(), second.unwrap()];
        outcomes.sort_by_key(|o| matches!(o, CompactionOutcome::Locked));

        assert!(matches!(
            outcomes[0],
            CompactionOutcome::Snapshotted(SnapshotOutcome::Created { seq: 3, .. })
        ));
        assert_eq!(outcomes[1], CompactionOutcome::Locked);
        assert_eq!(h.store.snapshot_count(doc), 1);
        assert_eq!(h.sync.state_fetches(), 1);
    }

    #[tokio::test]
    async fn test_invalidation_cooldown() {
        let h = Harness::with_threshold(200);
        let doc = h.document().await;
        h.store
            .add_collaborator(doc, UserId(2), Role::Viewer)
            .await
            .unwrap();

        let first = h.jobs().invalidate_collaborators(doc, true).await.unwrap();
        assert_eq!(first, InvalidationOutcome::Bumped(2));
        assert_eq!(h.cache.get_version(&Namespace::Owned(UserId(1))).await.unwrap(), 1);
        assert_eq!(h.cache.get_version(&Namespace::Shared(UserId(2))).await.unwrap(), 1);

        let second = h.jobs().invalidate_collaborators(doc, true).await.unwrap();
        assert_eq!(second, InvalidationOutcome::Throttled);

        // Bypassing the cooldown always bumps
        let forced = h.jobs().invalidate_collaborators(doc, false).await.unwrap();
        assert_eq!(forced, InvalidationOutcome::Bumped(2));
        assert_eq!(h.cache.get_version(&Namespace::Shared(UserId(2))).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_notify_permission_records_call() {
        let h = Harness::with_threshold(200);
        let doc = h.document().await;

        h.jobs()
            .notify_permission(doc, UserId(4), PermissionChange::revoked())
            .await
            .unwrap();

        assert_eq!(
            h.sync.permission_calls(),
            vec![(doc, UserId(4), "none".to_string())]
        );
        assert_eq!(h.cache.get_version(&Namespace::Shared(UserId(4))).await.unwrap(), 1);
        assert_eq!(h.jobs().counters.snapshot().notifications_sent, 1);
    }
}
