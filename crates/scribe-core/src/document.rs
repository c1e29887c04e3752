//! Document, update log and snapshot types

use crate::role::Role;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in unix milliseconds
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Document identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(pub u64);

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// User identifier, issued by the external auth layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Document metadata.
///
/// `update_seq` is the authoritative high-water mark of the update log. It only
/// ever moves forward, through the sequencer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub title: String,
    pub owner_id: UserId,
    pub update_seq: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

/// One opaque update fragment in a document's log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentUpdate {
    pub document_id: DocumentId,
    pub seq: u64,
    pub payload: Vec<u8>,
    pub author_id: UserId,
    pub created_at: u64,
}

/// Full materialized state captured at `seq`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub document_id: DocumentId,
    pub seq: u64,
    pub payload: Vec<u8>,
    pub created_at: u64,
}

/// Result of an idempotent snapshot write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOutcome {
    /// Snapshot inserted and superseded updates deleted
    Created { seq: u64, pruned: u64 },
    /// A snapshot at this seq was already present; nothing was written
    AlreadyExists { seq: u64 },
}

impl SnapshotOutcome {
    pub fn seq(&self) -> u64 {
        match self {
            SnapshotOutcome::Created { seq, .. } | SnapshotOutcome::AlreadyExists { seq } => *seq,
        }
    }
}

/// Role association between a user and a document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collaborator {
    pub document_id: DocumentId,
    pub user_id: UserId,
    pub role: Role,
    pub added_at: u64,
}

/// Latest snapshot plus every update recorded after it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterializedState {
    pub snapshot: Option<Vec<u8>>,
    pub snapshot_seq: u64,
    pub updates: Vec<DocumentUpdate>,
}

impl MaterializedState {
    /// Sequence of the newest fragment covered by this state
    pub fn head_seq(&self) -> u64 {
        self.updates.last().map_or(self.snapshot_seq, |u| u.seq)
    }
}

/// Pagination metadata for document listings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageMeta {
    pub total: u64,
    pub current_page: u32,
    pub per_page: u32,
    pub total_pages: u32,
}

impl PageMeta {
    pub fn new(total: u64, current_page: u32, per_page: u32) -> Self {
        let per_page = per_page.max(1);
        Self {
            total,
            current_page,
            per_page,
            total_pages: total.div_ceil(per_page as u64) as u32,
        }
    }
}

/// One page of a document listing, as stored in the list cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentPage {
    pub documents: Vec<Document>,
    pub meta: PageMeta,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_meta_rounds_up() {
        let meta = PageMeta::new(21, 1, 10);
        assert_eq!(meta.total_pages, 3);

        let empty = PageMeta::new(0, 1, 10);
        assert_eq!(empty.total_pages, 0);
    }

    #[test]
    fn test_head_seq() {
        let mut state = MaterializedState {
            snapshot: Some(vec![1]),
            snapshot_seq: 7,
            updates: Vec::new(),
        };
        assert_eq!(state.head_seq(), 7);

        state.updates.push(DocumentUpdate {
            document_id: DocumentId(1),
            seq: 9,
            payload: vec![2],
            author_id: UserId(1),
            created_at: 0,
        });
        assert_eq!(state.head_seq(), 9);
    }

    #[test]
    fn test_page_serializes() {
        let page = DocumentPage {
            documents: vec![],
            meta: PageMeta::new(0, 1, 10),
        };
        let json = serde_json::to_string(&page).unwrap();
        let back: DocumentPage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, page);
    }
}
