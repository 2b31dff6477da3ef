use axum::Json;
use axum::extract::State;

use crate::dto::ProviderResponse;
use crate::state::AppState;

pub async fn health() -> &'static str {
    "ok"
}

/// Backends whose credentials were found at startup.
pub async fn list_providers(State(state): State<AppState>) -> Json<Vec<ProviderResponse>> {
    Json(
        state
            .providers
            .available()
            .into_iter()
            .map(ProviderResponse::from)
            .collect(),
    )
}
