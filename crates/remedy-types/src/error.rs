//! Error types for model validation.

use thiserror::Error;

/// Result type alias for model operations.
pub type Result<T> = std::result::Result<T, TypesError>;

/// Errors raised while validating or converting model values.
#[derive(Debug, Error)]
pub enum TypesError {
    /// A playbook specification violates one of its invariants.
    #[error("invalid playbook '{playbook}': {reason}")]
    InvalidPlaybook { playbook: String, reason: String },

    /// A duration string could not be parsed.
    #[error("invalid duration '{0}'")]
    InvalidDuration(String),

    /// A status string does not name a known status.
    #[error("unknown status '{0}'")]
    UnknownStatus(String),

    /// A request body is inconsistent.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A state transition is not allowed by the run state machine.
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition { from: String, to: String },
}

impl TypesError {
    pub(crate) fn playbook(playbook: &str, reason: impl Into<String>) -> Self {
        TypesError::InvalidPlaybook {
            playbook: playbook.to_string(),
            reason: reason.into(),
        }
    }
}
