//! Application error type mapping to HTTP status codes and envelope format.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use chatrelay_types::error::{RepositoryError, SessionError};

use super::response::{ApiErrorDetail, ApiResponse};

/// Application-level error that maps to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    Session(SessionError),
    /// A lookup that is not keyed by session id found nothing.
    NotFound(String),
    Unauthorized(String),
    Validation(String),
    Internal(String),
}

impl From<SessionError> for AppError {
    fn from(e: SessionError) -> Self {
        AppError::Session(e)
    }
}

impl From<RepositoryError> for AppError {
    fn from(e: RepositoryError) -> Self {
        AppError::Internal(e.to_string())
    }
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, String, Option<serde_json::Value>) {
        match self {
            AppError::Session(e) => {
                let message = e.to_string();
                match e {
                    SessionError::SessionNotFound(_) => {
                        (StatusCode::NOT_FOUND, "SESSION_NOT_FOUND", message, None)
                    }
                    SessionError::PermissionDenied(_) => {
                        (StatusCode::FORBIDDEN, "PERMISSION_DENIED", message, None)
                    }
                    SessionError::DuplicateActiveSession { existing } => (
                        StatusCode::CONFLICT,
                        "DUPLICATE_ACTIVE_SESSION",
                        message,
                        Some(json!({ "existing_session_id": existing })),
                    ),
                    SessionError::InvalidOffset { .. } => {
                        (StatusCode::BAD_REQUEST, "INVALID_OFFSET", message, None)
                    }
                    SessionError::NotCancellable { status } => (
                        StatusCode::BAD_REQUEST,
                        "NOT_CANCELLABLE",
                        message,
                        Some(json!({ "status": status })),
                    ),
                    SessionError::UpstreamAvailability(_) => {
                        (StatusCode::INTERNAL_SERVER_ERROR, "UPSTREAM_UNAVAILABLE", message, None)
                    }
                    SessionError::CacheUnavailable(_) => {
                        (StatusCode::INTERNAL_SERVER_ERROR, "CACHE_UNAVAILABLE", message, None)
                    }
                    SessionError::RecoveryExpired(_) | SessionError::Internal(_) => {
                        (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message, None)
                    }
                }
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone(), None),
            AppError::Unauthorized(msg) => {
                (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg.clone(), None)
            }
            AppError::Validation(msg) => {
                (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone(), None)
            }
            AppError::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg.clone(), None)
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message, details) = self.parts();
        if status.is_server_error() {
            tracing::error!(code, %message, "request failed");
        }

        let body = ApiResponse::failure(ApiErrorDetail {
            code: code.to_string(),
            message,
            details,
        });

        (status, Json(body)).into_response()
    }
}
