//! Error types for the store crate.

use thiserror::Error;

/// Errors that can occur in the store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database connection or operation failed.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Schema migration failed.
    #[error("Migration error: {0}")]
    Migration(String),

    /// Serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Requested row not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A compare-and-set lost the race or a transition was illegal.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Model validation failed.
    #[error(transparent)]
    Types(#[from] remedy_types::TypesError),
}

impl StoreError {
    /// Busy/locked database errors clear up on retry.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
