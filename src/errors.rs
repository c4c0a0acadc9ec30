use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Storage quota exceeded (quota {quota}, used {used}, requested {requested})")]
    QuotaExceeded { quota: u64, used: u64, requested: u64 },

    #[error("Upload exceeds the maximum size of {max} bytes")]
    UploadTooLarge { max: u64 },

    #[error("Too many concurrent uploads from this client")]
    TooManyUploads,

    #[error("Upload session not found")]
    SessionNotFound,

    #[error("Upload session expired")]
    SessionExpired,

    #[error("Offset conflict: expected {expected}, got {got}")]
    OffsetConflict { expected: u64, got: u64 },

    #[error("Failed to finalize upload: {0}")]
    FinalizeFailure(String),

    #[error("Restore target already exists: {0}")]
    TrashConflict(String),

    #[error("Trash entry not found")]
    EntryNotFound,

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Unsupported media type")]
    UnsupportedMediaType,

    #[error("Not found")]
    NotFound,

    #[error("Forbidden")]
    Forbidden,

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Database(_)
            | AppError::Io(_)
            | AppError::Metrics(_)
            | AppError::Internal(_)
            | AppError::FinalizeFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Auth(_) => StatusCode::UNAUTHORIZED,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::QuotaExceeded { .. } | AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::UploadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::TooManyUploads => StatusCode::TOO_MANY_REQUESTS,
            AppError::SessionNotFound | AppError::EntryNotFound | AppError::NotFound => {
                StatusCode::NOT_FOUND
            }
            AppError::SessionExpired => StatusCode::GONE,
            AppError::OffsetConflict { .. }
            | AppError::TrashConflict(_)
            | AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let body = match self {
            AppError::QuotaExceeded {
                quota,
                used,
                requested,
            } => json!({
                "error": "Storage quota exceeded",
                "quota": quota,
                "used": used,
                "requested": requested,
                "status": status.as_u16()
            }),
            AppError::OffsetConflict { expected, got } => json!({
                "error": "Upload offset mismatch",
                "expected": expected,
                "got": got,
                "status": status.as_u16()
            }),
            AppError::Database(ref e) => {
                tracing::error!("Database error: {}", e);
                json!({"error": "Database error", "status": status.as_u16()})
            }
            AppError::Io(ref e) => {
                tracing::error!("IO error: {}", e);
                json!({"error": "Storage error", "status": status.as_u16()})
            }
            AppError::Metrics(ref e) => {
                tracing::error!("Metrics error: {}", e);
                json!({"error": "Internal server error", "status": status.as_u16()})
            }
            AppError::Internal(ref e) => {
                tracing::error!("Internal error: {:#}", e);
                json!({"error": "Internal server error", "status": status.as_u16()})
            }
            AppError::FinalizeFailure(ref msg) => {
                tracing::error!("Finalize failure: {}", msg);
                json!({
                    "error": "Failed to finalize upload",
                    "retryable": true,
                    "status": status.as_u16()
                })
            }
            other => json!({"error": other.to_string(), "status": status.as_u16()}),
        };

        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
