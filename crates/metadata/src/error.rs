//! Metadata store error types.

use thiserror::Error;

/// Metadata store operation errors.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("{collection}/{key} not found")]
    NotFound {
        collection: &'static str,
        key: String,
    },

    #[error("{collection}/{key} already exists")]
    AlreadyExists {
        collection: &'static str,
        key: String,
    },

    #[error("transaction aborted after {attempts} conflict retries")]
    Aborted { attempts: u32 },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("watcher lagged behind the event stream")]
    WatchLagged,

    #[error("watch stream closed")]
    WatchClosed,

    #[error("internal error: {0}")]
    Internal(String),
}

impl MetadataError {
    /// Whether this error is a transient write conflict worth retrying.
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Database(sqlx::Error::Database(db)) => {
                let msg = db.message();
                msg.contains("database is locked") || msg.contains("database table is locked")
            }
            _ => false,
        }
    }
}

/// Result type for metadata operations.
pub type MetadataResult<T> = std::result::Result<T, MetadataError>;
