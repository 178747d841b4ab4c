//! Error types for the segbackup core library.

use thiserror::Error;

use crate::catalog::ObjectKind;

/// Result type alias using the library's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the segbackup library.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database connection or query error
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Compression error
    #[error("Compression error: {0}")]
    Compression(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Manifest error
    #[error("Manifest error: {0}")]
    Manifest(String),

    /// Backup not found
    #[error("Backup not found: {0}")]
    BackupNotFound(String),

    /// A share/exclusive lock could not be acquired within the bounded wait
    #[error("Timed out after {waited_ms}ms waiting for lock on {relation}")]
    LockTimeout { relation: String, waited_ms: u64 },

    /// A competing exclusive operation holds the relation
    #[error("Lock conflict on {relation}: {holder}")]
    LockConflict { relation: String, holder: String },

    /// The dependency graph contains a cycle the resolver cannot break
    #[error("Dependency cycle between: {}", .0.join(", "))]
    DependencyCycle(Vec<String>),

    /// A statistic slot kind the target engine cannot store
    #[error("Unsupported statistic kind {kind} in slot {slot} of {relation}.{column}")]
    UnsupportedStatisticKind {
        relation: String,
        column: String,
        slot: usize,
        kind: i16,
    },

    /// Writing planner statistics into the target catalog failed
    #[error("Failed to write statistics for {relation}: {message}")]
    CatalogWriteFailure { relation: String, message: String },

    /// A single TOC entry failed to apply
    #[error("Failed to apply {object_kind} {name} (entry {ordinal}): {reason}")]
    EntryExecution {
        ordinal: u32,
        object_kind: ObjectKind,
        name: String,
        reason: String,
    },

    /// The run was cancelled before all entries were dispatched
    #[error("Run cancelled")]
    Cancelled,

    /// A worker task panicked or was aborted, taking its session with it
    #[error("Worker task failed: {0}")]
    Worker(String),
}

/// Database-specific errors
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DatabaseError {
    /// Connection failed
    #[error("Failed to connect to {target}: {message}")]
    ConnectionFailed { target: String, message: String },

    /// A query or statement failed
    #[error("Query failed: {0}")]
    Query(String),

    /// Referenced object does not exist
    #[error("Object does not exist: {0}")]
    ObjectNotFound(String),

    /// Object already exists
    #[error("Object already exists: {0}")]
    ObjectExists(String),

    /// Exported snapshot is unknown or expired
    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    /// Statement issued outside of a transaction
    #[error("No transaction in progress")]
    NoTransaction,

    /// Unparseable server version string
    #[error("Unrecognized server version: {0}")]
    Version(String),
}

/// Storage-specific errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// Object not found
    #[error("Object not found: {0}")]
    NotFound(String),

    /// Permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Storage backend error
    #[error("Backend error: {0}")]
    Backend(String),

    /// Invalid path
    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Database(DatabaseError::Query(err.to_string()))
    }
}
