//! Domain-level error taxonomy for LMSH.
//!
//! Every failure surfaced by the engine or the pipeline is one of these
//! variants. Adapter errors are classified here before any retry or
//! reporting decision (see `adapters::AdapterError`).

use lmsh_state::StorageError;

/// Errors produced by schema validation of desired state.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("{field} must not be empty")]
    Empty { field: &'static str },

    #[error("invalid course code {value:?}: {reason}")]
    CourseCode { value: String, reason: String },

    #[error("invalid organization {value:?}: {reason}")]
    Organization { value: String, reason: String },

    #[error("invalid assignment key {value:?}: {reason}")]
    AssignmentKey { value: String, reason: String },

    #[error("invalid student id {value:?}")]
    Student { value: String },

    #[error("points must be greater than zero, got {0}")]
    Points(u32),

    #[error("invalid due date {value:?}: expected YYYY-MM-DD")]
    DueDate { value: String },

    #[error("invalid template reference {value:?}: expected owner/repo")]
    Template { value: String },

    #[error("{0}")]
    Other(String),
}

/// LMSH domain errors.
#[derive(Debug, thiserror::Error)]
pub enum LmshError {
    /// Desired state or request input is malformed. Never retried.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Remote state disagrees with ours in a way that needs an operator.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Rate limiting, timeouts or unavailability that outlived the retry budget.
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("cancelled")]
    Cancelled,

    #[error("grading hook failed: {0}")]
    GradingHook(String),

    /// The remote answered with something we could not interpret.
    #[error("unexpected remote response: {0}")]
    Remote(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl LmshError {
    /// Short machine-readable category used in reports and logs.
    pub fn category(&self) -> &'static str {
        match self {
            LmshError::Validation(_) => "validation",
            LmshError::Conflict(_) => "conflict",
            LmshError::Transient(_) => "transient",
            LmshError::NotFound(_) => "not_found",
            LmshError::Unauthorized(_) => "unauthorized",
            LmshError::Storage(_) => "storage",
            LmshError::Cancelled => "cancelled",
            LmshError::GradingHook(_) => "grading_hook",
            LmshError::Remote(_) => "remote",
            LmshError::Serialization(_) => "serialization",
            LmshError::Io(_) => "io",
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, LmshError::Transient(_))
    }
}

/// Result type for LMSH domain operations.
pub type Result<T> = std::result::Result<T, LmshError>;
