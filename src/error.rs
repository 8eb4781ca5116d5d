//! Error handling module
//!
//! Provides the unified error type shared by executors, drivers, the sync
//! engine and the store. Every variant belongs to exactly one [`ErrorKind`],
//! which is what the scheduler and the status API reason about.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("Pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("MySQL error: {0}")]
    MySql(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Driver error: {0}")]
    Driver(String),

    #[error("Insufficient privilege: {0}")]
    Privilege(String),

    #[error("Unsupported engine: {0}")]
    UnsupportedEngine(String),

    #[error("Execution cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Error classification used for propagation decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Empty or malformed statement/payload. Never retried.
    InvalidInput,
    /// A referenced entity does not exist.
    NotFound,
    /// Connection or query failure against a live database or the store.
    Transport,
    /// Missing privilege or inconsistent catalog data.
    Integrity,
    /// Concurrent creation of the same row.
    Conflict,
    Cancelled,
    Internal,
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::InvalidPayload(_) | AppError::Validation(_) => ErrorKind::InvalidInput,
            AppError::NotFound(_) => ErrorKind::NotFound,
            AppError::Database(_)
            | AppError::Pool(_)
            | AppError::MySql(_)
            | AppError::Driver(_) => ErrorKind::Transport,
            AppError::Privilege(_) => ErrorKind::Integrity,
            AppError::Conflict(_) => ErrorKind::Conflict,
            AppError::Cancelled => ErrorKind::Cancelled,
            AppError::Serialization(_)
            | AppError::UnsupportedEngine(_)
            | AppError::Internal(_)
            | AppError::Config(_) => ErrorKind::Internal,
        }
    }
}

/// Error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, message, details) = match &self {
            AppError::Database(e) => {
                error!("Database error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "DATABASE_ERROR",
                    "A database error occurred".to_string(),
                    Some(e.to_string()),
                )
            }
            AppError::Pool(e) => {
                error!("Pool error: {:?}", e);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "POOL_EXHAUSTED",
                    "Database connection pool exhausted".to_string(),
                    Some(e.to_string()),
                )
            }
            AppError::MySql(e) => (
                StatusCode::BAD_GATEWAY,
                "DRIVER_ERROR",
                "A MySQL error occurred".to_string(),
                Some(e.to_string()),
            ),
            AppError::Driver(msg) => (
                StatusCode::BAD_GATEWAY,
                "DRIVER_ERROR",
                msg.clone(),
                None,
            ),
            AppError::InvalidPayload(msg) | AppError::Validation(msg) => (
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
                msg.clone(),
                None,
            ),
            AppError::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                msg.clone(),
                None,
            ),
            AppError::Conflict(msg) => (
                StatusCode::CONFLICT,
                "CONFLICT",
                msg.clone(),
                None,
            ),
            AppError::Privilege(msg) => (
                StatusCode::FORBIDDEN,
                "INSUFFICIENT_PRIVILEGE",
                msg.clone(),
                None,
            ),
            AppError::Cancelled => (
                StatusCode::CONFLICT,
                "CANCELLED",
                "Execution cancelled".to_string(),
                None,
            ),
            other => {
                error!("Internal error: {}", other);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                    Some(other.to_string()),
                )
            }
        };

        let body = Json(ErrorResponse {
            success: false,
            message,
            error: details,
            code: Some(error_code.to_string()),
        });

        (status, body).into_response()
    }
}

/// Result type alias used across the crate
pub type AppResult<T> = Result<T, AppError>;

/// Helper function to create an invalid payload error
pub fn invalid_payload(msg: impl Into<String>) -> AppError {
    AppError::InvalidPayload(msg.into())
}

/// Helper function to create a not found error
pub fn not_found_error(msg: impl Into<String>) -> AppError {
    AppError::NotFound(msg.into())
}

/// Helper function to create a driver error
pub fn driver_error(msg: impl Into<String>) -> AppError {
    AppError::Driver(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(invalid_payload("empty").kind(), ErrorKind::InvalidInput);
        assert_eq!(not_found_error("db").kind(), ErrorKind::NotFound);
        assert_eq!(driver_error("refused").kind(), ErrorKind::Transport);
        assert_eq!(AppError::Privilege("view".into()).kind(), ErrorKind::Integrity);
        assert_eq!(AppError::Cancelled.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn test_invalid_payload_message_is_verbatim() {
        let err = invalid_payload("empty create database statement");
        assert_eq!(err.to_string(), "Invalid payload: empty create database statement");
    }
}
