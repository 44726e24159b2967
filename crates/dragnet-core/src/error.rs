use thiserror::Error;

/// Application-wide error types for Dragnet.
#[derive(Error, Debug)]
pub enum AppError {
    /// Input rejected before it reached the queue (bad task id, empty payload).
    #[error("Validation error: {0}")]
    Validation(String),

    /// The shared coordination backend could not be reached.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Missing or malformed configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The external `process` collaborator failed.
    #[error("Process error: {message}")]
    ProcessError { message: String, retryable: bool },

    /// Request timed out.
    #[error("Timed out after {0} seconds")]
    Timeout(u64),

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Shorthand for a retryable processing failure.
    pub fn transient(message: impl Into<String>) -> Self {
        AppError::ProcessError {
            message: message.into(),
            retryable: true,
        }
    }

    /// Shorthand for a processing failure that no retry can fix.
    pub fn permanent(message: impl Into<String>) -> Self {
        AppError::ProcessError {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if a task that failed with this error is worth retrying.
    ///
    /// Anything not explicitly permanent counts as transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Validation(_) | AppError::SerializationError(_) => false,
            AppError::ProcessError { retryable, .. } => *retryable,
            _ => true,
        }
    }

    /// Returns true if this error means the coordination backend itself failed.
    ///
    /// Workers pause and retry on these instead of acknowledging the task.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            AppError::StoreUnavailable(_) | AppError::DatabaseError(_)
        )
    }
}
