//! Core Error Types
//!
//! Collaborator-level error types shared across the Forgeflow workspace.
//! These stay dependency-free (only thiserror + std + serde_json) so the core
//! crate can be consumed by agent backends without pulling in storage code.
//!
//! The application crate maps these into its own `AppError`, adding the
//! engine-level kinds (invalid transition, concurrent modification, ...).

use thiserror::Error;

/// Error type reported by external collaborators (agent backends).
#[derive(Error, Debug)]
pub enum CoreError {
    /// The collaborator could not be reached at all
    #[error("Collaborator unavailable: {0}")]
    Unavailable(String),

    /// The collaborator gave up waiting on the agent
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The session was cancelled before it produced an outcome
    #[error("Session cancelled: {0}")]
    Cancelled(String),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Not found errors
    #[error("Not found: {0}")]
    NotFound(String),

    /// Generic internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for core errors
pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// Create an unavailable error
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a cancelled error
    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Convert CoreError to a string
impl From<CoreError> for String {
    fn from(err: CoreError) -> String {
        err.to_string()
    }
}
