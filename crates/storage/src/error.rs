//! Storage error types.

use thiserror::Error;

/// Storage operation errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("chunk not found: {0}")]
    ChunkNotFound(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid chunk hash: {0}")]
    InvalidHash(String),

    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("invalid path: {0}")]
    Path(#[from] watershed_core::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
