//! Commit and commit-set handlers.

use super::{ndjson, parse_branch, parse_commit_set, parse_repo};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::Json;
use futures::stream;
use serde::Deserialize;
use watershed_core::ids::{BranchRef, CommitId};
use watershed_core::{CommitInfo, CommitSetInfo};

#[derive(Debug, Deserialize)]
pub struct StartCommitRequest {
    pub branch: String,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub description: String,
}

pub async fn start_commit(
    State(state): State<AppState>,
    Path(repo): Path<String>,
    Json(request): Json<StartCommitRequest>,
) -> ApiResult<Json<CommitInfo>> {
    let branch = BranchRef::new(parse_repo(&repo)?, parse_branch(&request.branch)?);
    let parent = match &request.parent {
        Some(parent) => Some(
            CommitId::parse(parent).map_err(|e| ApiError::InvalidArgument(e.to_string()))?,
        ),
        None => None,
    };
    let commit = state
        .graph
        .start_commit(branch, parent, request.description)
        .await?;
    Ok(Json(commit))
}

#[derive(Debug, Default, Deserialize)]
pub struct FinishCommitRequest {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub force: bool,
}

pub async fn finish_commit(
    State(state): State<AppState>,
    Path((repo, reference)): Path<(String, String)>,
    Json(request): Json<FinishCommitRequest>,
) -> ApiResult<Json<CommitInfo>> {
    let repo = parse_repo(&repo)?;
    let commit = state
        .graph
        .finish_commit(&repo, &reference, request.error, request.force)
        .await?;
    Ok(Json(commit))
}

#[derive(Debug, Default, Deserialize)]
pub struct InspectCommitQuery {
    #[serde(default)]
    pub wait: bool,
}

pub async fn inspect_commit(
    State(state): State<AppState>,
    Path((repo, reference)): Path<(String, String)>,
    Query(query): Query<InspectCommitQuery>,
) -> ApiResult<Json<CommitInfo>> {
    let repo = parse_repo(&repo)?;
    let commit = state
        .graph
        .inspect_commit(&repo, &reference, query.wait)
        .await?;
    Ok(Json(commit))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListCommitQuery {
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub number: Option<u64>,
    #[serde(default)]
    pub reverse: bool,
}

pub async fn list_commit(
    State(state): State<AppState>,
    Path(repo): Path<String>,
    Query(query): Query<ListCommitQuery>,
) -> ApiResult<Response> {
    let repo = parse_repo(&repo)?;
    let branch = match &query.branch {
        Some(branch) => Some(parse_branch(branch)?),
        None => None,
    };
    let commits = state
        .graph
        .list_commit(&repo, branch.as_ref(), query.number, query.reverse)
        .await?;
    ndjson(commits)
}

/// Stream commit changes on a repo (or one branch) as NDJSON, forever.
pub async fn subscribe_commit(
    State(state): State<AppState>,
    Path(repo): Path<String>,
    Query(query): Query<ListCommitQuery>,
) -> ApiResult<Response> {
    let repo = parse_repo(&repo)?;
    state.graph.inspect_repo(&repo).await?;
    let branch = match &query.branch {
        Some(branch) => Some(parse_branch(branch)?),
        None => None,
    };
    let watcher = state.graph.subscribe_commit(&repo, branch.as_ref());

    let stream = stream::unfold(watcher, |mut watcher| async move {
        loop {
            match watcher.next().await {
                Ok(event) => {
                    let mut line = match serde_json::to_vec(&event.record) {
                        Ok(line) => line,
                        Err(_) => continue,
                    };
                    line.push(b'\n');
                    return Some((
                        Ok::<_, std::convert::Infallible>(bytes::Bytes::from(line)),
                        watcher,
                    ));
                }
                Err(_) => return None,
            }
        }
    });
    Response::builder()
        .header("content-type", "application/x-ndjson")
        .body(Body::from_stream(stream))
        .map_err(|e| ApiError::Internal(e.to_string()))
}

pub async fn inspect_commit_set(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<CommitSetInfo>> {
    let id = parse_commit_set(&id)?;
    Ok(Json(state.graph.inspect_commit_set(id).await?))
}

pub async fn list_commit_set(State(state): State<AppState>) -> ApiResult<Response> {
    ndjson(state.graph.list_commit_set().await?)
}

pub async fn squash_commit_set(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let id = parse_commit_set(&id)?;
    state.graph.squash_commit_set(id).await?;
    Ok(Json(serde_json::json!({"squashed": id.to_string()})))
}

pub async fn drop_commit_set(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let id = parse_commit_set(&id)?;
    state.graph.drop_commit_set(id).await?;
    Ok(Json(serde_json::json!({"dropped": id.to_string()})))
}
