//! Job and datum handlers.

use super::{ndjson, parse_commit_set, parse_pipeline};
use crate::error::ApiResult;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::Json;
use serde::Deserialize;
use watershed_core::datum::DatumMeta;
use watershed_core::JobInfo;
use watershed_pipeline::{jobs, pipelines};

#[derive(Debug, Default, Deserialize)]
pub struct InspectJobQuery {
    #[serde(default)]
    pub wait: bool,
}

pub async fn inspect_job(
    State(state): State<AppState>,
    Path((pipeline, id)): Path<(String, String)>,
    Query(query): Query<InspectJobQuery>,
) -> ApiResult<Json<JobInfo>> {
    let pipeline = parse_pipeline(&pipeline)?;
    let id = parse_commit_set(&id)?;
    let job = pipelines::inspect_job(&state.graph, &pipeline, id, query.wait).await?;
    Ok(Json(job))
}

pub async fn list_job(
    State(state): State<AppState>,
    Path(pipeline): Path<String>,
) -> ApiResult<Response> {
    let pipeline = parse_pipeline(&pipeline)?;
    ndjson(jobs::list_jobs(&state.graph, &pipeline).await?)
}

pub async fn stop_job(
    State(state): State<AppState>,
    Path((pipeline, id)): Path<(String, String)>,
) -> ApiResult<Json<JobInfo>> {
    let pipeline = parse_pipeline(&pipeline)?;
    let id = parse_commit_set(&id)?;
    let job =
        pipelines::stop_job(&state.graph, state.orchestrator.queue(), &pipeline, id).await?;
    Ok(Json(job))
}

pub async fn list_datum(
    State(state): State<AppState>,
    Path((pipeline, id)): Path<(String, String)>,
) -> ApiResult<Response> {
    let pipeline = parse_pipeline(&pipeline)?;
    let id = parse_commit_set(&id)?;
    ndjson(pipelines::list_datum(&state.graph, &pipeline, id).await?)
}

pub async fn inspect_datum(
    State(state): State<AppState>,
    Path((pipeline, id, datum)): Path<(String, String, String)>,
) -> ApiResult<Json<DatumMeta>> {
    let pipeline = parse_pipeline(&pipeline)?;
    let id = parse_commit_set(&id)?;
    let meta = pipelines::inspect_datum(&state.graph, &pipeline, id, &datum).await?;
    Ok(Json(meta))
}

pub async fn restart_datum(
    State(state): State<AppState>,
    Path((pipeline, id, datum)): Path<(String, String, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    let pipeline = parse_pipeline(&pipeline)?;
    let id = parse_commit_set(&id)?;
    pipelines::restart_datum(&state.graph, state.orchestrator.queue(), &pipeline, id, &datum)
        .await?;
    Ok(Json(serde_json::json!({"restarted": datum})))
}
