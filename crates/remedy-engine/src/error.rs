//! Error types for the engine.

use remedy_store::StoreError;
use thiserror::Error;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised by the engine.
///
/// Variants follow the failure taxonomy callers act on: validation and
/// authorization errors are returned to the initiator, action failures are
/// recorded on the run, and transient errors are retried by the loop that hit
/// them.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The caller supplied something invalid.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// No (valid) credentials.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Authenticated, but not allowed.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The entity is not in a state that allows the operation.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// An action returned a failure outcome (non-zero exit, HTTP >= 400, SQL error).
    #[error("{0}")]
    ActionFailed(String),

    /// The operation needs something this process was not configured with.
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("cancelled")]
    Cancelled,

    #[error("timeout")]
    Timeout,

    /// A CEL expression failed to compile or evaluate.
    #[error("Expression error: {0}")]
    Expression(String),

    /// A `{{...}}` template could not be resolved.
    #[error("Template error: {0}")]
    Template(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// An upstream HTTP call failed at the transport level or with a 5xx.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Upstream error: {0}")]
    Upstream(#[from] remedy_client::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] remedy_config::ConfigError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Errors expected to clear up on retry.
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::Store(e) => e.is_transient(),
            EngineError::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().is_some_and(|s| s.is_server_error())
            }
            EngineError::Upstream(e) => e.is_transient(),
            EngineError::Io(_) => true,
            _ => false,
        }
    }

    /// Map store `NotFound`/`Conflict` onto the engine variants callers match on.
    pub(crate) fn from_store(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(msg) => EngineError::NotFound(msg),
            StoreError::Conflict(msg) => EngineError::Conflict(msg),
            other => EngineError::Store(other),
        }
    }
}

impl From<remedy_types::TypesError> for EngineError {
    fn from(e: remedy_types::TypesError) -> Self {
        EngineError::Validation(e.to_string())
    }
}
