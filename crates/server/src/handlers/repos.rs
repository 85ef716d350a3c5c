//! Repo handlers.

use super::{ndjson, parse_repo};
use crate::error::ApiResult;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::Json;
use serde::Deserialize;
use watershed_core::{RepoInfo, RepoType};

#[derive(Debug, Deserialize)]
pub struct CreateRepoRequest {
    pub name: String,
    #[serde(default, rename = "type")]
    pub typ: Option<RepoType>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub update: bool,
}

pub async fn create_repo(
    State(state): State<AppState>,
    Json(request): Json<CreateRepoRequest>,
) -> ApiResult<Json<RepoInfo>> {
    let name = parse_repo(&request.name)?;
    let repo = state
        .graph
        .create_repo(
            name,
            request.typ.unwrap_or_default(),
            request.description,
            request.update,
        )
        .await?;
    Ok(Json(repo))
}

pub async fn inspect_repo(
    State(state): State<AppState>,
    Path(repo): Path<String>,
) -> ApiResult<Json<RepoInfo>> {
    let name = parse_repo(&repo)?;
    Ok(Json(state.graph.inspect_repo(&name).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListRepoQuery {
    #[serde(default, rename = "type")]
    pub typ: Option<RepoType>,
}

pub async fn list_repo(
    State(state): State<AppState>,
    Query(query): Query<ListRepoQuery>,
) -> ApiResult<Response> {
    let repos = state.graph.list_repo(query.typ).await?;
    ndjson(repos)
}

#[derive(Debug, Default, Deserialize)]
pub struct ForceQuery {
    #[serde(default)]
    pub force: bool,
}

pub async fn delete_repo(
    State(state): State<AppState>,
    Path(repo): Path<String>,
    Query(query): Query<ForceQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let name = parse_repo(&repo)?;
    state.graph.delete_repo(&name, query.force).await?;
    Ok(Json(serde_json::json!({"deleted": repo})))
}
