//! Commit graph error taxonomy.

use thiserror::Error;
use watershed_core::ids::{BranchRef, CommitRef, CommitSetId, RepoName};

/// Errors raised by graph operations.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("repo {0} not found")]
    RepoNotFound(RepoName),

    #[error("branch {0} not found")]
    BranchNotFound(BranchRef),

    #[error("commit {0} not found")]
    CommitNotFound(String),

    #[error("commit set {0} not found")]
    CommitSetNotFound(CommitSetId),

    #[error("commit {0} is already finished")]
    CommitFinished(CommitRef),

    #[error("commit {0} was deleted")]
    CommitDeleted(CommitRef),

    #[error("creating branch {branch} would make provenance cyclic")]
    ProvenanceCycle { branch: BranchRef },

    #[error("invalid parent: {0}")]
    InvalidParent(String),

    #[error("cannot propagate to {branch}: provenance head {head} is open in another commit set")]
    Unpropagatable { branch: BranchRef, head: CommitRef },

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error(transparent)]
    Core(#[from] watershed_core::Error),

    #[error(transparent)]
    Metadata(#[from] watershed_metadata::MetadataError),

    #[error(transparent)]
    Storage(#[from] watershed_storage::StorageError),
}

/// Result type for graph operations.
pub type GraphResult<T> = std::result::Result<T, GraphError>;
