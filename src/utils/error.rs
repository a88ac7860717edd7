//! Error Handling
//!
//! Unified error types for the engine.
//! Uses thiserror for ergonomic error definitions.

use forgeflow_core::CoreError;
use thiserror::Error;

/// Engine-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Operation attempted from a state that forbids it
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// Referenced workflow/step/conversation/message does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// The entity changed between read and write
    #[error("Concurrent modification: {0}")]
    ConcurrentModification(String),

    /// Agent stream or persistence could not be reached
    #[error("Collaborator unavailable: {0}")]
    CollaboratorUnavailable(String),

    /// The agent run itself reported an error outcome
    #[error("Agent failure: {0}")]
    AgentFailure(String),

    /// Database errors
    #[error("Database error: {0}")]
    Database(String),

    /// SQLite errors (auto-converted from rusqlite::Error)
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// File I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Result type alias for engine errors
pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    /// Create an invalid transition error
    pub fn invalid_transition(msg: impl Into<String>) -> Self {
        Self::InvalidTransition(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a concurrent modification error
    pub fn concurrent_modification(msg: impl Into<String>) -> Self {
        Self::ConcurrentModification(msg.into())
    }

    /// Create a collaborator unavailable error
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::CollaboratorUnavailable(msg.into())
    }

    /// Create an agent failure error
    pub fn agent_failure(msg: impl Into<String>) -> Self {
        Self::AgentFailure(msg.into())
    }

    /// Create a database error
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Whether a read may fall back to its last cached projection.
    ///
    /// Mutations never use this: they surface every error unchanged.
    pub fn is_read_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ConcurrentModification(_) | Self::CollaboratorUnavailable(_)
        )
    }
}

impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Unavailable(msg) => Self::CollaboratorUnavailable(msg),
            CoreError::Timeout(msg) => Self::AgentFailure(format!("timed out: {}", msg)),
            CoreError::Cancelled(msg) => {
                Self::InvalidTransition(format!("session cancelled: {}", msg))
            }
            CoreError::Serialization(e) => Self::Serialization(e),
            CoreError::Validation(msg) => Self::Validation(msg),
            CoreError::NotFound(msg) => Self::NotFound(msg),
            CoreError::Internal(msg) => Self::AgentFailure(msg),
        }
    }
}

/// Convert AppError to a string suitable for UI responses
impl From<AppError> for String {
    fn from(err: AppError) -> String {
        err.to_string()
    }
}
