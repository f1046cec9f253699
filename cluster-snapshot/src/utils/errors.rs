//! Error types for snapshot and replay operations.
//!
//! Per-record variants (`Collection`, `Conversion`, `Apply`) are recovered
//! locally and reported as warnings. Everything else ends the operation.

use crate::cluster::ApiError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to collect {kind} in {}: {source}", scope_label(.namespace))]
    Collection {
        kind: String,
        namespace: String,
        #[source]
        source: ApiError,
    },

    #[error("Failed to convert {kind} {}/{name}: {reason}", scope_label(.namespace))]
    Conversion {
        kind: String,
        namespace: String,
        name: String,
        reason: String,
    },

    #[error("Failed to apply {kind} {}/{name}: {source}", scope_label(.namespace))]
    Apply {
        kind: String,
        namespace: String,
        name: String,
        #[source]
        source: ApiError,
    },

    #[error("Resource API error: {0}")]
    Api(#[from] ApiError),

    #[error("Storage error: {context}: {source}")]
    Storage {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid manifest {path}: {reason}")]
    Manifest { path: String, reason: String },

    #[error("Unsupported snapshot format version: {0}")]
    UnsupportedFormat(String),

    #[error("Duplicate resource in snapshot: {0}")]
    DuplicateRecord(String),

    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("Operation cancelled after {completed} of {total} resources")]
    Cancelled { completed: usize, total: usize },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SnapshotError {
    /// Wrap an I/O failure with a short description of what was being done.
    pub fn storage(context: impl Into<String>, source: std::io::Error) -> Self {
        SnapshotError::Storage {
            context: context.into(),
            source,
        }
    }

    /// True for errors that abort a whole backup or restore.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            SnapshotError::Collection { .. }
                | SnapshotError::Conversion { .. }
                | SnapshotError::Apply { .. }
        )
    }
}

fn scope_label(namespace: &str) -> &str {
    if namespace.is_empty() {
        "cluster"
    } else {
        namespace
    }
}

pub type Result<T> = std::result::Result<T, SnapshotError>;
