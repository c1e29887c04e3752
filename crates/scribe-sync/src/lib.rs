//! Client for the external sync service
//!
//! The sync service owns the CRDT merge engine. Scribe only asks it for the
//! merged state of a document (to snapshot it) and tells it about permission
//! changes and deletions. All calls are best-effort from the caller's point of
//! view: failures are reported, never retried here.

use async_trait::async_trait;
use scribe_core::{DocumentId, PermissionChange, UserId};
use thiserror::Error;

mod http;

pub use http::{HttpSyncClient, SyncConfig, INTERNAL_SECRET_HEADER};

/// Operations Scribe needs from the sync service
#[async_trait]
pub trait SyncClient: Send + Sync {
    /// Current merged CRDT state of a document
    async fn fetch_document_state(&self, doc: DocumentId) -> Result<Vec<u8>, SyncError>;

    /// Tell the sync service a user's role on a document changed
    async fn update_user_permission(
        &self,
        doc: DocumentId,
        user: UserId,
        change: PermissionChange,
    ) -> Result<(), SyncError>;

    /// Tell the sync service a document was deleted
    async fn remove_document(&self, doc: DocumentId) -> Result<(), SyncError>;
}

/// Sync service errors
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Sync request timed out: {0}")]
    Timeout(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Sync server error: status={status} body={body}")]
    Status { status: u16, body: String },

    #[error("Invalid sync response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            SyncError::Timeout(e.to_string())
        } else if e.is_decode() {
            SyncError::Decode(e.to_string())
        } else {
            SyncError::Transport(e.to_string())
        }
    }
}

impl From<SyncError> for scribe_core::Error {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::Timeout(msg) => scribe_core::Error::Timeout(msg),
            other => scribe_core::Error::UpstreamUnavailable(other.to_string()),
        }
    }
}
