//! Error types for the tally core library.

use std::path::PathBuf;
use thiserror::Error;

/// Core error types for tally operations.
///
/// A line that does not look like a checklist item is not an error (the
/// parser returns `None`), and two documents disagreeing about a shared
/// identity is reported inside a reconciliation result rather than here.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(
        "Structural inconsistency in {}: line {line} is past the end of the document ({line_count} lines)",
        path.display()
    )]
    StructuralInconsistency {
        path: PathBuf,
        line: usize,
        line_count: usize,
    },

    #[error("Reconciliation of {} is stale", .0.display())]
    StaleReconciliation(PathBuf),

    #[error("Document store error: {0}")]
    Store(String),

    #[error("Document not found: {}", .0.display())]
    DocumentNotFound(PathBuf),

    #[error("Invalid task ID: {0}")]
    InvalidTaskId(String),

    #[error("File watcher error: {0}")]
    Watcher(String),
}

impl Error {
    /// True for errors raised at the host document boundary. The index is
    /// never modified when one of these is returned, so callers may retry.
    pub fn is_io_failure(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Store(_) | Error::DocumentNotFound(_)
        )
    }
}

/// Result type alias using the tally Error type.
pub type Result<T> = std::result::Result<T, Error>;
