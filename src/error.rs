//! SyncMesh Error Types

use thiserror::Error;

/// Result type alias for SyncMesh operations
pub type Result<T> = std::result::Result<T, Error>;

/// SyncMesh error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Node not found: {0}")]
    NodeNotFound(i64),

    #[error("Credential error for node {node_id}: {reason}")]
    Credentials { node_id: i64, reason: String },

    #[error("No runtime driver for database kind {0}")]
    UnsupportedDialect(String),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Registry error: {0}")]
    Registry(#[from] rusqlite::Error),

    #[error("Query execution failed: {0}")]
    QueryExecution(String),

    #[error("Statement timed out after {0} ms")]
    Timeout(u64),

    // Replication errors
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Target version {target_version} is newer than event version {event_version} (table={table}, pk={pk_value})")]
    Conflict {
        table: String,
        pk_value: String,
        event_version: i64,
        target_version: i64,
    },

    #[error("Unknown sync operation: {0}")]
    UnknownOperation(String),

    #[error("Source row no longer exists: {table}.{pk_value}")]
    SourceRowMissing { table: String, pk_value: String },

    // Administrative errors
    #[error("Sync event {event_id} not found on node {node_id}")]
    EventNotFound { node_id: i64, event_id: i64 },

    #[error("Node name already exists: {0}")]
    DuplicateNode(String),

    #[error("Alert delivery failed: {0}")]
    Alert(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// How a failure is handled once it has been recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed input; stays failed until an operator acts.
    Validation,
    /// Version mismatch on a target; operator is alerted.
    Conflict,
    /// Network or SQL failure; the recovery sweep retries it.
    Transient,
    /// Unknown node, bad credentials, missing driver; retrying cannot help.
    Configuration,
}

impl Error {
    /// Classify this error
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Validation(_)
            | Error::SourceRowMissing { .. }
            | Error::EventNotFound { .. }
            | Error::DuplicateNode(_) => ErrorClass::Validation,
            Error::Conflict { .. } => ErrorClass::Conflict,
            Error::Config(_)
            | Error::ConfigParse(_)
            | Error::NodeNotFound(_)
            | Error::Credentials { .. }
            | Error::UnsupportedDialect(_)
            | Error::UnknownOperation(_) => ErrorClass::Configuration,
            Error::Database(_)
            | Error::Registry(_)
            | Error::QueryExecution(_)
            | Error::Timeout(_)
            | Error::Alert(_)
            | Error::Io(_)
            | Error::Internal(_) => ErrorClass::Transient,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Check if this error is a version conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }
}
