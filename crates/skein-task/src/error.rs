//! Error types for skein-task

use thiserror::Error;

/// Result type alias using skein-task Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running a task
#[derive(Error, Debug)]
pub enum Error {
    /// An error from the model provider layer
    #[error(transparent)]
    Ai(#[from] skein_ai::Error),

    /// The task was aborted
    #[error("Task aborted")]
    Aborted,

    /// The task was aborted while waiting out a retry countdown
    #[error("Request cancelled: aborted during retry")]
    AbortedDuringRetry,

    /// Durable storage rejected a read or write
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Condensation or truncation could not be performed
    #[error("Context management error: {0}")]
    Context(String),

    /// The checkpoint collaborator failed
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// The task-creation collaborator failed
    #[error("Delegation error: {0}")]
    Delegation(String),

    /// The model finished a response without text or tool calls
    #[error("The model did not return any assistant content")]
    EmptyResponse,

    /// The task was disposed and can no longer be driven
    #[error("Task has been disposed")]
    Disposed,

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether this error is the result of an abort
    pub fn is_abort(&self) -> bool {
        matches!(
            self,
            Error::Aborted | Error::AbortedDuringRetry | Error::Ai(skein_ai::Error::Aborted)
        )
    }

    /// Check if this error indicates a context overflow
    pub fn is_context_overflow(&self) -> bool {
        match self {
            Error::Ai(e) => e.is_context_overflow(),
            _ => false,
        }
    }
}
