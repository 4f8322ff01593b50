//! Error taxonomy shared by every core component.

use crate::{access::AuthError, backend::BackendError, pool::ConnectionClass, types::StreamStatus};

/// Errors surfaced by stream operations.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("Stream not found: {0}")]
    NotFound(String),

    #[error("Stream already exists: {0}")]
    AlreadyExists(String),

    #[error("Stream {key} is already {status}")]
    AlreadyEnded { key: String, status: StreamStatus },

    #[error("Stream {key} is {status}")]
    StreamClosed { key: String, status: StreamStatus },

    #[error("Unauthorized: {0}")]
    Unauthorized(#[from] AuthError),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("No {0} connection available")]
    PoolExhausted(ConnectionClass),

    #[error("Backend failure: {0}")]
    Backend(#[from] BackendError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StreamError {
    /// Stable machine-readable code for the error kind.
    pub fn code(&self) -> &'static str {
        match self {
            StreamError::NotFound(_) => "not-found",
            StreamError::AlreadyExists(_) => "already-exists",
            StreamError::AlreadyEnded { .. } => "already-ended",
            StreamError::StreamClosed { .. } => "stream-closed",
            StreamError::Unauthorized(_) => "unauthorized",
            StreamError::Validation(_) => "validation",
            StreamError::PoolExhausted(_) => "pool-exhausted",
            StreamError::Backend(_) => "backend-failure",
            StreamError::Internal(_) => "internal",
        }
    }
}

pub type Result<T, E = StreamError> = std::result::Result<T, E>;
