//! Scribe Storage Backends
//!
//! Persists documents, their ordered update logs, snapshots and collaborators:
//! - Memory (default): volatile, one lock per store acting as the transaction
//! - SQLite: embedded persistence
//! - PostgreSQL: shared persistence for multi-instance deployments
//!
//! Every backend gives the same two atomicity guarantees: the sequence bump and
//! the update insert commit together, and a snapshot insert commits together with
//! the deletion of the updates it supersedes.

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;
#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;
use scribe_core::{
    Collaborator, Document, DocumentId, DocumentPage, DocumentSnapshot, DocumentUpdate,
    MaterializedState, Role, SnapshotOutcome, UserId,
};

/// Default page size for update log reads
pub const UPDATE_PAGE_SIZE: usize = 500;

/// Storage backend trait
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Create a document and register `owner` as its owner collaborator
    async fn create_document(&self, owner: UserId, title: &str) -> Result<Document, StorageError>;

    /// Load document metadata
    async fn find_document(&self, id: DocumentId) -> Result<Option<Document>, StorageError>;

    /// Change a document's title
    async fn rename_document(&self, id: DocumentId, title: &str) -> Result<Document, StorageError>;

    /// Delete a document with its updates, snapshots and collaborators
    async fn delete_document(&self, id: DocumentId) -> Result<bool, StorageError>;

    /// Atomically bump `update_seq` and insert the update carrying the new value
    async fn append_update(
        &self,
        id: DocumentId,
        author: UserId,
        payload: &[u8],
    ) -> Result<u64, StorageError>;

    /// Updates with `seq > since_seq`, ascending, at most `limit` of them
    async fn updates_since(
        &self,
        id: DocumentId,
        since_seq: u64,
        limit: usize,
    ) -> Result<Vec<DocumentUpdate>, StorageError>;

    /// Current `update_seq` high-water mark
    async fn current_seq(&self, id: DocumentId) -> Result<u64, StorageError>;

    /// Insert a snapshot at `seq` unless one exists, pruning updates up to `seq`
    async fn create_snapshot_if_absent(
        &self,
        id: DocumentId,
        seq: u64,
        payload: &[u8],
    ) -> Result<SnapshotOutcome, StorageError>;

    /// Highest-seq snapshot, if any
    async fn latest_snapshot(&self, id: DocumentId) -> Result<Option<DocumentSnapshot>, StorageError>;

    /// Seq of the latest snapshot, 0 when the document has none
    async fn last_snapshot_seq(&self, id: DocumentId) -> Result<u64, StorageError> {
        Ok(self.latest_snapshot(id).await?.map_or(0, |s| s.seq))
    }

    /// Latest snapshot composed with every update after it
    ///
    /// The snapshot and the update pages are read from one consistent view, so a
    /// compaction committing mid-read can never drop fragments from the result.
    /// `NotFound` for unknown documents.
    async fn materialized_state(
        &self,
        id: DocumentId,
        page_size: usize,
    ) -> Result<MaterializedState, StorageError>;

    /// Role of `user` on the document, `None` when not a collaborator
    async fn role_of(&self, id: DocumentId, user: UserId) -> Result<Option<Role>, StorageError>;

    /// Collaborators in the order they were added
    async fn list_collaborators(&self, id: DocumentId) -> Result<Vec<Collaborator>, StorageError>;

    /// Register a collaborator; `AlreadyExists` if the user already has a role
    async fn add_collaborator(
        &self,
        id: DocumentId,
        user: UserId,
        role: Role,
    ) -> Result<Collaborator, StorageError>;

    /// Change a collaborator's role; `NotFound` if the user has none
    async fn update_collaborator_role(
        &self,
        id: DocumentId,
        user: UserId,
        role: Role,
    ) -> Result<(), StorageError>;

    /// Drop a collaborator; `NotFound` if the user has no role
    async fn remove_collaborator(&self, id: DocumentId, user: UserId) -> Result<(), StorageError>;

    /// Documents owned by `owner`, most recently updated first
    async fn list_owned_documents(
        &self,
        owner: UserId,
        page: u32,
        per_page: u32,
    ) -> Result<DocumentPage, StorageError>;

    /// Documents shared with `user` under a non-owner role, most recently updated first
    async fn list_shared_documents(
        &self,
        user: UserId,
        page: u32,
        per_page: u32,
    ) -> Result<DocumentPage, StorageError>;
}

/// Storage error types
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Connection error: {0}")]
    Connection(String),
}

impl From<StorageError> for scribe_core::Error {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(msg) => scribe_core::Error::NotFound(msg),
            StorageError::AlreadyExists(msg) => scribe_core::Error::Conflict(msg),
            StorageError::InvalidInput(msg) => scribe_core::Error::InvalidInput(msg),
            StorageError::Database(msg) | StorageError::Connection(msg) => {
                scribe_core::Error::Storage(msg)
            }
        }
    }
}

fn document_not_found(id: DocumentId) -> StorageError {
    StorageError::NotFound(format!("document {id}"))
}

fn page_offset(page: u32, per_page: u32) -> u64 {
    (page.max(1) as u64 - 1) * per_page as u64
}

/// Sequence numbers as SQL parameters; values past `i64::MAX` match nothing
#[cfg(any(feature = "sqlite", feature = "postgres"))]
fn seq_param(seq: u64) -> i64 {
    i64::try_from(seq).unwrap_or(i64::MAX)
}

fn state_from_snapshot(snapshot: Option<DocumentSnapshot>) -> MaterializedState {
    match snapshot {
        Some(snapshot) => MaterializedState {
            snapshot: Some(snapshot.payload),
            snapshot_seq: snapshot.seq,
            updates: Vec::new(),
        },
        None => MaterializedState::default(),
    }
}

/// Page through the log after `state.snapshot_seq` until a short page comes back
///
/// Callers hold whatever lock or transaction makes `fetch` see one view.
fn drain_updates(
    state: &mut MaterializedState,
    page_size: usize,
    mut fetch: impl FnMut(u64, usize) -> Result<Vec<DocumentUpdate>, StorageError>,
) -> Result<(), StorageError> {
    let page_size = page_size.max(1);
    let mut cursor = state.snapshot_seq;
    loop {
        let page = fetch(cursor, page_size)?;
        let fetched = page.len();
        if let Some(last) = page.last() {
            cursor = last.seq;
        }
        state.updates.extend(page);
        if fetched < page_size {
            return Ok(());
        }
    }
}

pub use memory::MemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;
