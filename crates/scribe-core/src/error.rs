//! Error types for Scribe

use thiserror::Error;

/// Errors surfaced by Scribe operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Sync service unavailable: {0}")]
    UpstreamUnavailable(String),
}

impl Error {
    pub fn document_not_found(id: impl std::fmt::Display) -> Self {
        Error::NotFound(format!("document {id}"))
    }

    /// Stable label used for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
            Error::Forbidden(_) => "forbidden",
            Error::InvalidInput(_) => "invalid_input",
            Error::Timeout(_) => "timeout",
            Error::Storage(_) => "storage",
            Error::Cache(_) => "cache",
            Error::UpstreamUnavailable(_) => "upstream_unavailable",
        }
    }
}

/// Result type alias for Scribe operations
pub type Result<T> = std::result::Result<T, Error>;
