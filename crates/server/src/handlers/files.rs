//! File handlers: the ModifyFile op stream and the read surface.

use super::{ndjson, parse_repo};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::Json;
use base64::Engine;
use serde::Deserialize;
use watershed_graph::FileOp;
use watershed_storage::{FileDiff, FileMetadata};

/// One op of a ModifyFile batch. Ops apply in order, atomically, to one
/// open commit.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOpRequest {
    AddFile {
        path: String,
        /// Base64-encoded file content.
        data: String,
    },
    DeleteFile {
        path: String,
    },
    CopyFile {
        src_repo: String,
        src_commit: String,
        src_path: String,
        dst_path: String,
    },
}

#[derive(Debug, Deserialize)]
pub struct ModifyFileRequest {
    pub ops: Vec<FileOpRequest>,
}

pub async fn modify_file(
    State(state): State<AppState>,
    Path((repo, reference)): Path<(String, String)>,
    Json(request): Json<ModifyFileRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let repo = parse_repo(&repo)?;
    let mut ops = Vec::with_capacity(request.ops.len());
    for op in request.ops {
        ops.push(match op {
            FileOpRequest::AddFile { path, data } => {
                let data = base64::engine::general_purpose::STANDARD
                    .decode(data)
                    .map_err(|e| ApiError::InvalidArgument(format!("bad base64 data: {e}")))?;
                FileOp::Add {
                    path,
                    data: data.into(),
                }
            }
            FileOpRequest::DeleteFile { path } => FileOp::Delete { path },
            FileOpRequest::CopyFile {
                src_repo,
                src_commit,
                src_path,
                dst_path,
            } => FileOp::Copy {
                src_repo: parse_repo(&src_repo)?,
                src_reference: src_commit,
                src_path,
                dst_path,
            },
        });
    }
    let applied = ops.len();
    state.graph.modify_file(&repo, &reference, ops).await?;
    Ok(Json(serde_json::json!({"applied_ops": applied})))
}

#[derive(Debug, Deserialize)]
pub struct FileQuery {
    pub path: String,
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub length: Option<u64>,
}

pub async fn get_file(
    State(state): State<AppState>,
    Path((repo, reference)): Path<(String, String)>,
    Query(query): Query<FileQuery>,
) -> ApiResult<Response> {
    let repo = parse_repo(&repo)?;
    let data = state
        .graph
        .get_file(&repo, &reference, &query.path, query.offset, query.length)
        .await?;
    Response::builder()
        .header("content-type", "application/octet-stream")
        .body(axum::body::Body::from(data))
        .map_err(|e| ApiError::Internal(e.to_string()))
}

pub async fn get_file_tar(
    State(state): State<AppState>,
    Path((repo, reference)): Path<(String, String)>,
    Query(query): Query<FileQuery>,
) -> ApiResult<Response> {
    let repo = parse_repo(&repo)?;
    let data = state
        .graph
        .get_file_tar(&repo, &reference, &query.path)
        .await?;
    Response::builder()
        .header("content-type", "application/x-tar")
        .body(axum::body::Body::from(data))
        .map_err(|e| ApiError::Internal(e.to_string()))
}

pub async fn inspect_file(
    State(state): State<AppState>,
    Path((repo, reference)): Path<(String, String)>,
    Query(query): Query<FileQuery>,
) -> ApiResult<Json<FileMetadata>> {
    let repo = parse_repo(&repo)?;
    Ok(Json(
        state.graph.inspect_file(&repo, &reference, &query.path).await?,
    ))
}

pub async fn list_file(
    State(state): State<AppState>,
    Path((repo, reference)): Path<(String, String)>,
    Query(query): Query<FileQuery>,
) -> ApiResult<Response> {
    let repo = parse_repo(&repo)?;
    ndjson(state.graph.list_file(&repo, &reference, &query.path).await?)
}

pub async fn walk_file(
    State(state): State<AppState>,
    Path((repo, reference)): Path<(String, String)>,
    Query(query): Query<FileQuery>,
) -> ApiResult<Response> {
    let repo = parse_repo(&repo)?;
    ndjson(state.graph.walk_file(&repo, &reference, &query.path).await?)
}

#[derive(Debug, Deserialize)]
pub struct GlobQuery {
    pub pattern: String,
}

pub async fn glob_file(
    State(state): State<AppState>,
    Path((repo, reference)): Path<(String, String)>,
    Query(query): Query<GlobQuery>,
) -> ApiResult<Response> {
    let repo = parse_repo(&repo)?;
    ndjson(
        state
            .graph
            .glob_file(&repo, &reference, &query.pattern)
            .await?,
    )
}

#[derive(Debug, Default, Deserialize)]
pub struct DiffQuery {
    #[serde(default)]
    pub old_repo: Option<String>,
    #[serde(default)]
    pub old_commit: Option<String>,
}

pub async fn diff_file(
    State(state): State<AppState>,
    Path((repo, reference)): Path<(String, String)>,
    Query(query): Query<DiffQuery>,
) -> ApiResult<Json<FileDiff>> {
    let repo = parse_repo(&repo)?;
    let old_repo = match &query.old_repo {
        Some(old_repo) => Some(parse_repo(old_repo)?),
        None => None,
    };
    let old = match (&old_repo, &query.old_commit) {
        (Some(old_repo), Some(old_commit)) => Some((old_repo, old_commit.as_str())),
        (None, Some(old_commit)) => Some((&repo, old_commit.as_str())),
        _ => None,
    };
    Ok(Json(state.graph.diff_file(&repo, &reference, old).await?))
}
