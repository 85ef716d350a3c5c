//! Branch handlers.

use super::{ndjson, parse_branch, parse_repo, ForceQuery};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::Json;
use serde::Deserialize;
use watershed_core::ids::{BranchRef, CommitId};
use watershed_core::{BranchInfo, Trigger};

#[derive(Debug, Deserialize)]
pub struct CreateBranchRequest {
    pub name: String,
    #[serde(default)]
    pub head: Option<String>,
    /// Provenance branches in `repo@branch` form.
    #[serde(default)]
    pub provenance: Vec<String>,
    #[serde(default)]
    pub trigger: Option<Trigger>,
    #[serde(default)]
    pub new_commit_set: bool,
}

pub async fn create_branch(
    State(state): State<AppState>,
    Path(repo): Path<String>,
    Json(request): Json<CreateBranchRequest>,
) -> ApiResult<Json<BranchInfo>> {
    let repo = parse_repo(&repo)?;
    let branch = BranchRef::new(repo, parse_branch(&request.name)?);
    let head = match &request.head {
        Some(head) => Some(
            CommitId::parse(head).map_err(|e| ApiError::InvalidArgument(e.to_string()))?,
        ),
        None => None,
    };
    let mut provenance = Vec::with_capacity(request.provenance.len());
    for upstream in &request.provenance {
        provenance
            .push(BranchRef::parse(upstream).map_err(|e| ApiError::InvalidArgument(e.to_string()))?);
    }
    let info = state
        .graph
        .create_branch(branch, head, provenance, request.trigger, request.new_commit_set)
        .await?;
    Ok(Json(info))
}

pub async fn inspect_branch(
    State(state): State<AppState>,
    Path((repo, branch)): Path<(String, String)>,
) -> ApiResult<Json<BranchInfo>> {
    let branch = BranchRef::new(parse_repo(&repo)?, parse_branch(&branch)?);
    Ok(Json(state.graph.inspect_branch(&branch).await?))
}

pub async fn list_branch(
    State(state): State<AppState>,
    Path(repo): Path<String>,
) -> ApiResult<Response> {
    let repo = parse_repo(&repo)?;
    ndjson(state.graph.list_branch(&repo).await?)
}

pub async fn delete_branch(
    State(state): State<AppState>,
    Path((repo, branch)): Path<(String, String)>,
    Query(query): Query<ForceQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let branch = BranchRef::new(parse_repo(&repo)?, parse_branch(&branch)?);
    state.graph.delete_branch(&branch, query.force).await?;
    Ok(Json(serde_json::json!({"deleted": branch.to_string()})))
}
