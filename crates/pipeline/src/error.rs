//! Pipeline orchestration error types.

use thiserror::Error;
use watershed_core::ids::{CommitSetId, PipelineName};
use watershed_metadata::{MetadataError, TxError};

/// Errors raised by the orchestrator, controllers, and workers.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline {0} not found")]
    PipelineNotFound(PipelineName),

    #[error("job {pipeline}@{id} not found")]
    JobNotFound {
        pipeline: PipelineName,
        id: CommitSetId,
    },

    #[error("datum {0} not found")]
    DatumNotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("invalid job transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("transform failed: {0}")]
    Transform(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error(transparent)]
    Core(#[from] watershed_core::Error),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Graph(#[from] watershed_graph::GraphError),

    #[error(transparent)]
    Storage(#[from] watershed_storage::StorageError),
}

impl TxError for PipelineError {
    fn as_metadata(&self) -> Option<&MetadataError> {
        match self {
            Self::Metadata(e) => Some(e),
            Self::Graph(watershed_graph::GraphError::Metadata(e)) => Some(e),
            _ => None,
        }
    }
}

/// Result type for pipeline operations.
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
