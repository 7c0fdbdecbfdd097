use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use perfil_core::error::AppError;

use crate::dto::ErrorResponse;

/// Wrapper so we can implement `IntoResponse` for `AppError`.
pub struct ApiError(pub AppError);

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self.0 {
            AppError::UnavailableInput(_) => (StatusCode::NOT_FOUND, "unavailable_input"),
            AppError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
            AppError::RateLimited(_) => (StatusCode::SERVICE_UNAVAILABLE, "rate_limited"),
            AppError::Transport(_) => (StatusCode::SERVICE_UNAVAILABLE, "transport"),
            AppError::Exhausted(_) => (StatusCode::BAD_GATEWAY, "exhausted"),
            AppError::Http { .. } => (StatusCode::BAD_GATEWAY, "upstream_http"),
            AppError::ProtectionDetected(_) => (StatusCode::BAD_GATEWAY, "protection_detected"),
            AppError::Generic(msg) if msg.starts_with("invalid company key") => {
                (StatusCode::BAD_REQUEST, "invalid_key")
            }
            AppError::SchemaViolation(_) | AppError::Serialization(_) => {
                (StatusCode::BAD_REQUEST, "validation_error")
            }
            AppError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "database_error"),
            AppError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        let body = ErrorResponse {
            error: error_type.to_string(),
            message: self.0.to_string(),
        };

        (status, axum::Json(body)).into_response()
    }
}
