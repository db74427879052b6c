//! Error types for the pagedrop service.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Application error type.
///
/// Every variant maps to a stable machine-readable code and an HTTP status.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("Total content exceeds the {limit_mb}MB size limit")]
    PayloadTooLarge { limit_mb: usize },

    #[error("Rate limit exceeded. Please try again in {}.", format_wait(.retry_after_secs))]
    RateLimited { retry_after_secs: u64 },

    #[error("Server is busy. Please try again in {retry_after_secs} seconds.")]
    Busy { retry_after_secs: u64 },

    #[error("You already have a request in progress. Please wait for it to complete.")]
    LockContention,

    #[error("You must be logged in")]
    Unauthorized,

    #[error("{0}")]
    Forbidden(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("You have reached the maximum limit of {max} artifacts. Please delete some existing artifacts to create new ones.")]
    QuotaExceeded { max: i64 },

    #[error("Artifact ID already exists")]
    Conflict,

    #[error("Storage operation failed: {0}")]
    Storage(String),

    #[error("Copy from {source_prefix} failed after {copied} objects")]
    PartialCopy {
        source_prefix: String,
        copied: usize,
    },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("KV store error: {0}")]
    Kv(#[from] redis::RedisError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable machine-readable error code for response bodies.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "BAD_REQUEST",
            AppError::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            AppError::RateLimited { .. } => "RATE_LIMITED",
            AppError::Busy { .. } => "BUSY",
            AppError::LockContention => "LOCK_CONTENTION",
            AppError::Unauthorized => "UNAUTHORIZED",
            AppError::Forbidden(_) => "FORBIDDEN",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            AppError::Conflict => "CONFLICT",
            AppError::Storage(_) => "STORAGE_ERROR",
            AppError::PartialCopy { .. } => "PARTIAL_COPY",
            AppError::Database(_) => "DATABASE_ERROR",
            AppError::Kv(_) => "KV_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::RateLimited { .. } | AppError::Busy { .. } | AppError::LockContention => {
                StatusCode::TOO_MANY_REQUESTS
            }
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) | AppError::QuotaExceeded { .. } => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict => StatusCode::CONFLICT,
            AppError::Storage(_) | AppError::PartialCopy { .. } => StatusCode::BAD_GATEWAY,
            AppError::Database(_) | AppError::Kv(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Retry-after hint for admission rejections, if any.
    fn retry_after(&self) -> Option<u64> {
        match self {
            AppError::RateLimited { retry_after_secs } | AppError::Busy { retry_after_secs } => {
                Some(*retry_after_secs)
            }
            _ => None,
        }
    }
}

/// JSON error body returned to clients.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub message: String,
    pub code: &'static str,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Internal details stay in the logs, not in responses.
        let message = match &self {
            AppError::Database(e) => {
                tracing::error!(error = %e, "Database error");
                "Internal server error".to_string()
            }
            AppError::Kv(e) => {
                tracing::error!(error = %e, "KV store error");
                "Internal server error".to_string()
            }
            AppError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal error");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        let retry_after = self.retry_after();
        let mut response = (
            status,
            Json(ErrorBody {
                message,
                code: self.code(),
            }),
        )
            .into_response();

        if let Some(secs) = retry_after {
            response.headers_mut().insert(
                header::RETRY_AFTER,
                HeaderValue::from_str(&secs.to_string())
                    .unwrap_or_else(|_| HeaderValue::from_static("60")),
            );
        }

        response
    }
}

/// Format a wait duration the way rate-limit messages present it.
fn format_wait(secs: &u64) -> String {
    let secs = *secs;
    if secs >= 3600 {
        format!("{} hours", secs / 3600)
    } else if secs >= 60 {
        format!("{} minutes", secs / 60)
    } else {
        format!("{} seconds", secs)
    }
}
