//! Error types for the sync service.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use medbridge_engine::SyncError;
use serde::Serialize;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors surfaced by the HTTP layer.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Request body or parameters were malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Webhook signature missing or wrong.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Configuration file missing or inconsistent.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Engine failure while serving the request.
    #[error(transparent)]
    Sync(#[from] SyncError),
}

impl ServerError {
    /// Maps the error to its HTTP status.
    ///
    /// Retryable engine failures become 503 so the webhook sender redelivers;
    /// permanent ones become 500 and must not be redelivered blindly.
    pub fn status(&self) -> StatusCode {
        match self {
            ServerError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ServerError::Config(_) | ServerError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServerError::Sync(e) if e.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
            ServerError::Sync(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    retryable: bool,
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        let retryable = matches!(&self, ServerError::Sync(e) if e.is_retryable());
        let body = ErrorBody {
            error: self.to_string(),
            retryable,
        };
        (status, Json(body)).into_response()
    }
}
