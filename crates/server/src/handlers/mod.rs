//! Request handlers.

pub mod branches;
pub mod commits;
pub mod files;
pub mod jobs;
pub mod pipelines;
pub mod repos;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::body::Body;
use axum::extract::State;
use axum::response::Response;
use axum::Json;
use futures::stream;
use serde::Serialize;
use watershed_core::ids::{BranchName, CommitSetId, PipelineName, RepoName};

pub use branches::*;
pub use commits::*;
pub use files::*;
pub use jobs::*;
pub use pipelines::*;
pub use repos::*;

/// Health check.
pub async fn health_check(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    state.store.health_check().await?;
    Ok(Json(serde_json::json!({"status": "ok"})))
}

/// Stream a list as newline-delimited JSON.
pub(crate) fn ndjson<T: Serialize>(items: Vec<T>) -> ApiResult<Response> {
    let mut lines = Vec::with_capacity(items.len());
    for item in items {
        let mut line =
            serde_json::to_vec(&item).map_err(|e| ApiError::Internal(e.to_string()))?;
        line.push(b'\n');
        lines.push(Ok::<_, std::convert::Infallible>(bytes::Bytes::from(line)));
    }
    Response::builder()
        .header("content-type", "application/x-ndjson")
        .body(Body::from_stream(stream::iter(lines)))
        .map_err(|e| ApiError::Internal(e.to_string()))
}

pub(crate) fn parse_repo(name: &str) -> ApiResult<RepoName> {
    RepoName::new(name).map_err(|e| ApiError::InvalidArgument(e.to_string()))
}

pub(crate) fn parse_branch(name: &str) -> ApiResult<BranchName> {
    BranchName::new(name).map_err(|e| ApiError::InvalidArgument(e.to_string()))
}

pub(crate) fn parse_pipeline(name: &str) -> ApiResult<PipelineName> {
    PipelineName::new(name).map_err(|e| ApiError::InvalidArgument(e.to_string()))
}

pub(crate) fn parse_commit_set(id: &str) -> ApiResult<CommitSetId> {
    CommitSetId::parse(id).map_err(|e| ApiError::InvalidArgument(e.to_string()))
}
