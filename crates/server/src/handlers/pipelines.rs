//! Pipeline handlers.

use super::{ndjson, parse_pipeline};
use crate::error::ApiResult;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::response::Response;
use axum::Json;
use serde::Deserialize;
use watershed_core::{PipelineConfig, PipelineInfo};
use watershed_pipeline::pipelines;

#[derive(Debug, Deserialize)]
pub struct CreatePipelineRequest {
    #[serde(flatten)]
    pub config: PipelineConfig,
    #[serde(default)]
    pub update: bool,
}

pub async fn create_pipeline(
    State(state): State<AppState>,
    Json(request): Json<CreatePipelineRequest>,
) -> ApiResult<Json<PipelineInfo>> {
    let info =
        pipelines::create_pipeline(&state.graph, request.config, request.update).await?;
    state.orchestrator.ensure_controller(info.name().clone()).await;
    Ok(Json(info))
}

pub async fn inspect_pipeline(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<PipelineInfo>> {
    let name = parse_pipeline(&name)?;
    Ok(Json(pipelines::inspect_pipeline(&state.graph, &name).await?))
}

pub async fn list_pipeline(State(state): State<AppState>) -> ApiResult<Response> {
    ndjson(pipelines::list_pipeline(&state.graph).await?)
}

pub async fn delete_pipeline(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let name = parse_pipeline(&name)?;
    state.orchestrator.drop_controller(&name).await;
    pipelines::delete_pipeline(&state.graph, state.orchestrator.queue(), &name).await?;
    Ok(Json(serde_json::json!({"deleted": name.to_string()})))
}

pub async fn start_pipeline(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let name = parse_pipeline(&name)?;
    pipelines::start_pipeline(&state.graph, &name).await?;
    Ok(Json(serde_json::json!({"started": name.to_string()})))
}

pub async fn stop_pipeline(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let name = parse_pipeline(&name)?;
    pipelines::stop_pipeline(&state.graph, &name).await?;
    Ok(Json(serde_json::json!({"stopped": name.to_string()})))
}

pub async fn run_pipeline(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let name = parse_pipeline(&name)?;
    let set = pipelines::run_pipeline(&state.graph, &name).await?;
    Ok(Json(serde_json::json!({"commit_set": set.to_string()})))
}
