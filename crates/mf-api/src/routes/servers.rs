use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;

use mf_infra::ProviderName;
use mf_infra::orchestrator::Orchestrator;
use mf_infra::types::ServerInfo;

use crate::dto::{ServerRequest, UploadPluginRequest};
use crate::error::ApiError;
use crate::state::AppState;

fn orchestrator(state: &AppState, provider: &str) -> Result<Orchestrator, ApiError> {
    let name: ProviderName = provider.parse()?;
    let backend = state
        .providers
        .get(name)
        .ok_or_else(|| ApiError::NotFound(format!("provider not configured: {name}")))?;
    Ok(Orchestrator::new(backend.clone()))
}

pub async fn create_server(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Json(req): Json<ServerRequest>,
) -> Result<(StatusCode, Json<ServerInfo>), ApiError> {
    let orch = orchestrator(&state, &provider)?;
    let info = orch.create(&req.into_args(state.config.default_timeout)).await?;
    Ok((StatusCode::CREATED, Json(info)))
}

pub async fn list_servers(
    State(state): State<AppState>,
    Path(provider): Path<String>,
) -> Result<Json<Vec<ServerInfo>>, ApiError> {
    let orch = orchestrator(&state, &provider)?;
    Ok(Json(orch.list().await?))
}

/// Per-server reads still need the descriptor for key paths and
/// resource names, so status is a POST with the usual body.
pub async fn server_status(
    State(state): State<AppState>,
    Path((provider, id)): Path<(String, String)>,
    Json(req): Json<ServerRequest>,
) -> Result<Json<ServerInfo>, ApiError> {
    let orch = orchestrator(&state, &provider)?;
    Ok(Json(orch.get(&id, &req.into_args(state.config.default_timeout)).await?))
}

pub async fn update_server(
    State(state): State<AppState>,
    Path((provider, id)): Path<(String, String)>,
    Json(req): Json<ServerRequest>,
) -> Result<StatusCode, ApiError> {
    let orch = orchestrator(&state, &provider)?;
    orch.update(&id, &req.into_args(state.config.default_timeout)).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn upload_plugin(
    State(state): State<AppState>,
    Path((provider, id)): Path<(String, String)>,
    Json(req): Json<UploadPluginRequest>,
) -> Result<StatusCode, ApiError> {
    let orch = orchestrator(&state, &provider)?;
    let args = req.server.into_args(state.config.default_timeout);
    orch.upload(&id, &args, &req.plugin_path, &req.destination)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_server(
    State(state): State<AppState>,
    Path((provider, id)): Path<(String, String)>,
    Json(req): Json<ServerRequest>,
) -> Result<StatusCode, ApiError> {
    let orch = orchestrator(&state, &provider)?;
    orch.delete(&id, &req.into_args(state.config.default_timeout)).await?;
    Ok(StatusCode::NO_CONTENT)
}
