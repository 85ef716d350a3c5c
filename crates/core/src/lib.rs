//! Core domain types and shared logic for the watershed versioning service.
//!
//! This crate defines the canonical data model used across all other crates:
//! - Repo, branch, and commit identifiers
//! - Commit and commit-set records forming the provenance DAG
//! - Branch triggers
//! - Fileset handles and path normalization
//! - Pipeline configs, input trees, and glob compilation
//! - Job, datum, and process-stat records
//! - Application configuration

pub mod branch;
pub mod commit;
pub mod config;
pub mod datum;
pub mod error;
pub mod fileset;
pub mod glob;
pub mod ids;
pub mod input;
pub mod job;
pub mod pipeline;
pub mod repo;

pub use branch::{BranchInfo, Trigger};
pub use commit::{CommitInfo, CommitOrigin, CommitSetInfo};
pub use datum::{Datum, DatumInput, DatumMeta, FileIdentity};
pub use error::{Error, Result};
pub use fileset::FilesetId;
pub use glob::Glob;
pub use ids::{
    BranchName, BranchRef, CommitId, CommitRef, CommitSetId, PipelineName, RepoName, TaskId,
};
pub use input::{Input, PfsInput};
pub use job::{DatumState, JobInfo, JobState, ProcessStats};
pub use pipeline::{PipelineConfig, PipelineInfo, PipelineState, Transform};
pub use repo::{RepoInfo, RepoType};

/// Default lines of stdout/stderr retained per datum attempt.
pub const MAX_LOG_LINES: usize = 1000;
