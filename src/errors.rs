//! Shared error taxonomy and the standard `{"error": {...}}` envelope.
//!
//! Logical drops (duplicate, rate-limited, too-old on
//! ingress) are NOT represented here — those are ordinary `200` responses
//! with a body field, handled directly in the API layer.

use axum::{http::StatusCode, response::IntoResponse, response::Response, Json};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidInput,
    Unauthorized,
    TtlExpired,
    DbError,
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    InvalidInput(String),
    #[error("{0}")]
    TooLarge(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("too many auth attempts")]
    AuthRateLimited,
    #[error("ttl expired")]
    TtlExpired,
    #[error("not found")]
    NotFound,
    #[error("db error: {0}")]
    DbError(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn code(&self) -> ErrorCode {
        match self {
            ApiError::InvalidInput(_) => ErrorCode::InvalidInput,
            ApiError::TooLarge(_) => ErrorCode::InvalidInput,
            ApiError::Unauthorized => ErrorCode::Unauthorized,
            // Pre-auth rate limiting still reports the UNAUTHORIZED code;
            // only the HTTP status distinguishes it from a bad credential (429 vs 401).
            ApiError::AuthRateLimited => ErrorCode::Unauthorized,
            ApiError::TtlExpired => ErrorCode::TtlExpired,
            ApiError::NotFound => ErrorCode::InvalidInput,
            ApiError::DbError(_) => ErrorCode::DbError,
            ApiError::Internal(_) => ErrorCode::Internal,
        }
    }

    fn retryable(&self) -> bool {
        matches!(
            self,
            ApiError::DbError(_) | ApiError::Internal(_) | ApiError::AuthRateLimited
        )
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ApiError::TooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::AuthRateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::TtlExpired => StatusCode::GONE,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::DbError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: ErrorCode,
    detail: String,
    retryable: bool,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code(),
                detail: self.to_string(),
                retryable: self.retryable(),
            },
        };
        (status, Json(body)).into_response()
    }
}
