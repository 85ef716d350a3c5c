//! API error types.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use watershed_graph::GraphError;
use watershed_metadata::MetadataError;
use watershed_pipeline::PipelineError;

/// API error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error code for programmatic handling.
    pub code: String,
    /// Human-readable error message.
    pub message: String,
}

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("aborted: {0}")]
    Aborted(String),

    #[error("canceled")]
    Canceled,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Wire code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::AlreadyExists(_) => "already_exists",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::FailedPrecondition(_) => "failed_precondition",
            Self::Aborted(_) => "aborted",
            Self::Canceled => "canceled",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Unauthenticated(_) => "unauthenticated",
            Self::PermissionDenied(_) => "permission_denied",
            Self::Internal(_) => "internal",
        }
    }

    /// HTTP status for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::AlreadyExists(_) => StatusCode::CONFLICT,
            Self::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Self::FailedPrecondition(_) => StatusCode::PRECONDITION_FAILED,
            Self::Aborted(_) => StatusCode::CONFLICT,
            Self::Canceled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
            Self::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::PermissionDenied(_) => StatusCode::FORBIDDEN,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(code = self.code(), error = %self, "Request failed");
        }
        let body = ErrorResponse {
            code: self.code().to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<MetadataError> for ApiError {
    fn from(e: MetadataError) -> Self {
        match e {
            MetadataError::NotFound { .. } => Self::NotFound(e.to_string()),
            MetadataError::AlreadyExists { .. } => Self::AlreadyExists(e.to_string()),
            MetadataError::Aborted { .. } => Self::Aborted(e.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<GraphError> for ApiError {
    fn from(e: GraphError) -> Self {
        match e {
            GraphError::RepoNotFound(_)
            | GraphError::BranchNotFound(_)
            | GraphError::CommitNotFound(_)
            | GraphError::CommitSetNotFound(_)
            | GraphError::CommitDeleted(_) => Self::NotFound(e.to_string()),
            GraphError::AlreadyExists(_) => Self::AlreadyExists(e.to_string()),
            GraphError::CommitFinished(_)
            | GraphError::ProvenanceCycle { .. }
            | GraphError::Unpropagatable { .. }
            | GraphError::Precondition(_) => Self::FailedPrecondition(e.to_string()),
            GraphError::InvalidParent(_) => Self::InvalidArgument(e.to_string()),
            GraphError::Core(core) => Self::InvalidArgument(core.to_string()),
            GraphError::Metadata(meta) => meta.into(),
            GraphError::Storage(storage) => storage_error(storage),
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::PipelineNotFound(_)
            | PipelineError::JobNotFound { .. }
            | PipelineError::DatumNotFound(_) => Self::NotFound(e.to_string()),
            PipelineError::AlreadyExists(_) => Self::AlreadyExists(e.to_string()),
            PipelineError::InvalidTransition { .. } | PipelineError::Precondition(_) => {
                Self::FailedPrecondition(e.to_string())
            }
            PipelineError::Core(core) => Self::InvalidArgument(core.to_string()),
            PipelineError::Metadata(meta) => meta.into(),
            PipelineError::Graph(graph) => graph.into(),
            PipelineError::Storage(storage) => storage_error(storage),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<watershed_core::Error> for ApiError {
    fn from(e: watershed_core::Error) -> Self {
        Self::InvalidArgument(e.to_string())
    }
}

fn storage_error(e: watershed_storage::StorageError) -> ApiError {
    use watershed_storage::StorageError;
    match e {
        StorageError::ChunkNotFound(_) | StorageError::FileNotFound(_) => {
            ApiError::NotFound(e.to_string())
        }
        StorageError::InvalidHash(_) | StorageError::InvalidRange(_) | StorageError::Path(_) => {
            ApiError::InvalidArgument(e.to_string())
        }
        other => ApiError::Internal(other.to_string()),
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::FailedPrecondition("x".into()).status_code(),
            StatusCode::PRECONDITION_FAILED
        );
        assert_eq!(
            ApiError::Aborted("x".into()).status_code(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn test_graph_error_mapping() {
        let e: ApiError = GraphError::CommitNotFound("r@c".to_string()).into();
        assert_eq!(e.code(), "not_found");
        let e: ApiError = GraphError::Precondition("open".to_string()).into();
        assert_eq!(e.code(), "failed_precondition");
    }
}
