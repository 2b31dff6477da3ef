use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::ApiError;
use crate::state::AppState;

/// Rejects requests whose bearer token is not `CONTROL_PLANE_API_KEY`.
pub async fn auth_middleware(State(state): State<AppState>, req: Request, next: Next) -> Response {
    match bearer_token(req.headers()) {
        Some(token) if token == state.config.control_plane_api_key => next.run(req).await,
        _ => {
            tracing::debug!(path = %req.uri().path(), "rejected request without a valid key");
            ApiError::Unauthorized.into_response()
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}
