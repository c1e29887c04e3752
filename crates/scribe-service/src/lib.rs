//! Scribe document service
//!
//! Foreground operations (writes, reads, collaborator management, listings)
//! plus the background jobs they schedule on the worker pool:
//! - compaction: snapshot a document once its log passes the policy threshold
//! - invalidation: bump the listing cache versions of a document's collaborators
//! - notifications: tell the sync service about permission changes and deletions

mod config;
mod jobs;
mod service;

pub use config::{ServiceConfig, MAX_TITLE_LEN};
pub use jobs::{CompactionOutcome, InvalidationOutcome, JobStats};
pub use service::{DocumentService, DocumentView};

#[cfg(test)]
mod testing;
