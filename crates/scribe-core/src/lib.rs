//! Scribe Core - document model and compaction policy
//!
//! This crate provides the types shared by every Scribe component:
//! - Documents, update fragments, snapshots and collaborators
//! - Role guards deciding who may write or manage a document
//! - The compaction policy that decides when a log should be snapshotted

pub mod compaction;
pub mod document;
pub mod error;
pub mod role;

pub use compaction::{CompactionPolicy, DEFAULT_COMPACTION_THRESHOLD};
pub use document::{
    now_millis, Collaborator, Document, DocumentId, DocumentPage, DocumentSnapshot,
    DocumentUpdate, MaterializedState, PageMeta, SnapshotOutcome, UserId,
};
pub use error::{Error, Result};
pub use role::{PermissionChange, Role};
