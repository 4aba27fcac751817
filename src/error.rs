/// Unified error types for the vault pipeline
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the pipeline
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation payload could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid input (bad path, empty batch, unknown root)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Not found errors
    #[error("Not found: {0}")]
    NotFound(String),

    /// Conflict errors (e.g., move destination already exists)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A version-control command exited unsuccessfully
    #[error("git command failed: {command}\nstderr: {stderr}")]
    Vcs { command: String, stderr: String },

    /// Repository lock could not be acquired in time
    #[error("Timed out acquiring repository lock for {0}")]
    LockTimeout(String),

    /// A `wait_for` deadline passed before the event reached a terminal state
    #[error("Timed out after {waited_ms}ms waiting for event {event_id}")]
    WaitTimeout { event_id: i64, waited_ms: u64 },

    /// Filesystem watcher errors
    #[error("Watcher error: {0}")]
    Watch(String),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// Convert PipelineError to HTTP response
impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            PipelineError::Validation(_) | PipelineError::Serialization(_) => (
                StatusCode::BAD_REQUEST,
                "InvalidRequest",
                self.to_string(),
            ),
            PipelineError::NotFound(_) => (StatusCode::NOT_FOUND, "NotFound", self.to_string()),
            PipelineError::Conflict(_) => (StatusCode::CONFLICT, "Conflict", self.to_string()),
            PipelineError::WaitTimeout { .. } => (
                StatusCode::GATEWAY_TIMEOUT,
                "WaitTimeout",
                self.to_string(),
            ),
            PipelineError::Database(_) | PipelineError::Internal(_) | PipelineError::Io(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "InternalServerError",
                "Internal server error".to_string(), // Don't leak details
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "InternalServerError",
                self.to_string(),
            ),
        };

        let body = Json(ErrorResponse {
            error: error_code.to_string(),
            message,
        });

        (status, body).into_response()
    }
}

/// Result type alias for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;
