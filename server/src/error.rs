//! API error type and its mapping onto HTTP responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use sheetload::{ErrorKind, SheetloadError, WorkerError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found (404)
    #[error("{0}")]
    NotFound(String),

    /// Invalid request (400)
    #[error("{0}")]
    BadRequest(String),

    /// Request clashes with work already in progress (409)
    #[error("{0}")]
    Conflict(String),

    /// Workers cannot take more tasks right now (503)
    #[error("{0}")]
    Unavailable(String),

    /// Internal server error (500)
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            ApiError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

impl From<SheetloadError> for ApiError {
    fn from(err: SheetloadError) -> Self {
        let message = err.to_string();
        match err {
            SheetloadError::InvalidRequest(msg) => ApiError::BadRequest(msg),
            SheetloadError::NotFound(msg) => ApiError::NotFound(msg),
            SheetloadError::Worker(WorkerError::QueueFull) => ApiError::Unavailable(message),
            SheetloadError::Worker(WorkerError::AlreadyInFlight(_)) => ApiError::Conflict(message),
            SheetloadError::Duplicate(_) => ApiError::Conflict(message),
            other => match other.kind() {
                ErrorKind::NotFound => ApiError::NotFound(message),
                ErrorKind::UnsupportedFormat | ErrorKind::ParseError => {
                    ApiError::BadRequest(message)
                }
                _ => {
                    tracing::error!(error = %message, "Request failed");
                    ApiError::Internal(message)
                }
            },
        }
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        ApiError::Internal(format!("Background task failed: {}", err))
    }
}

impl From<axum::extract::multipart::MultipartError> for ApiError {
    fn from(err: axum::extract::multipart::MultipartError) -> Self {
        ApiError::BadRequest(format!("Invalid multipart body: {}", err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.parts();
        let body = Json(json!({
            "error": {
                "code": code,
                "message": self.to_string(),
            }
        }));

        (status, body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
