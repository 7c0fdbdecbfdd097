use std::sync::Arc;

use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::dto::ErrorResponse;
use crate::state::AppState;

/// Middleware validating the `x-api-key` header against the configured
/// shared secret. With no secret configured, everything passes (local
/// development).
pub async fn require_api_key(
    State(state): State<Arc<AppState>>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let Some(expected) = &state.api_token else {
        return next.run(request).await;
    };

    let presented = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok());

    if presented != Some(expected.as_str()) {
        let body = ErrorResponse {
            error: "unauthorized".to_string(),
            message: "Missing or invalid x-api-key header".to_string(),
        };
        return (StatusCode::UNAUTHORIZED, axum::Json(body)).into_response();
    }

    next.run(request).await
}
