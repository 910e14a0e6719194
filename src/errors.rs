use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Error taxonomy for the auth service.
///
/// Lower layers never swallow these; they propagate upward unchanged and the
/// HTTP layer maps them to status codes in `IntoResponse`.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// Deliberately generic: never distinguishes "no such user" from
    /// "wrong password" or "account locked" to the caller.
    #[error("Invalid credentials")]
    Authentication,

    #[error("Token expired")]
    TokenExpired,

    #[error("Invalid token: {0}")]
    TokenInvalid(String),

    /// A rotated or revoked refresh token was presented again. The whole
    /// chain has been revoked before this error surfaces.
    #[error("Refresh token reuse detected")]
    TokenReuse,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AuthError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            AuthError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
            AuthError::Authentication => (
                StatusCode::UNAUTHORIZED,
                "INVALID_CREDENTIALS",
                "Invalid credentials".to_string(),
            ),
            AuthError::TokenExpired => (
                StatusCode::UNAUTHORIZED,
                "TOKEN_EXPIRED",
                "Token has expired".to_string(),
            ),
            AuthError::TokenInvalid(_) => (
                StatusCode::UNAUTHORIZED,
                "INVALID_TOKEN",
                "Token is invalid".to_string(),
            ),
            // Clients receiving this must discard all tokens for the session.
            AuthError::TokenReuse => (
                StatusCode::UNAUTHORIZED,
                "TOKEN_REUSE",
                "Refresh token reuse detected; session revoked".to_string(),
            ),
            AuthError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AuthError::StoreUnavailable(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "STORE_UNAVAILABLE",
                "Service temporarily unavailable".to_string(),
            ),
        };

        let body = ErrorResponse {
            error: ErrorDetail {
                code: code.to_string(),
                message,
            },
        };

        (status, Json(body)).into_response()
    }
}
