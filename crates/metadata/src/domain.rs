//! Collection bindings for the core domain records.
//!
//! Key formats and index names live here so every crate addresses the same
//! rows the same way.

use crate::collection::Record;
use watershed_core::ids::{BranchRef, CommitRef, CommitSetId, PipelineName};
use watershed_core::{BranchInfo, CommitInfo, JobInfo, PipelineInfo, RepoInfo};

/// Index names, one module per collection.
pub mod index {
    /// `commits` indexes.
    pub mod commits {
        pub const REPO: &str = "repo";
        pub const BRANCH: &str = "branch";
        pub const COMMIT_SET: &str = "commit_set";
    }

    /// `branches` indexes.
    pub mod branches {
        pub const REPO: &str = "repo";
    }

    /// `repos` indexes.
    pub mod repos {
        pub const TYPE: &str = "type";
    }

    /// `jobs` indexes.
    pub mod jobs {
        pub const PIPELINE: &str = "pipeline";
        pub const STATE: &str = "state";
        pub const PIPELINE_STATE: &str = "pipeline_state";
        pub const COMMIT_SET: &str = "commit_set";
    }
}

/// Key of a branch row: `repo@name`.
pub fn branch_key(branch: &BranchRef) -> String {
    format!("{}@{}", branch.repo, branch.name)
}

/// Key of a commit row: `repo@id`.
pub fn commit_key(commit: &CommitRef) -> String {
    format!("{}@{}", commit.repo, commit.id)
}

/// Key of a job row: `pipeline@commit_set`.
pub fn job_key(pipeline: &PipelineName, id: &CommitSetId) -> String {
    format!("{pipeline}@{id}")
}

/// Value of the `jobs.pipeline_state` compound index.
pub fn job_pipeline_state(pipeline: &PipelineName, state: watershed_core::JobState) -> String {
    format!("{pipeline}/{}", state.as_str())
}

impl Record for RepoInfo {
    const COLLECTION: &'static str = "repos";

    fn key(&self) -> String {
        self.name.to_string()
    }

    fn indexes(&self) -> Vec<(&'static str, String)> {
        vec![(index::repos::TYPE, self.typ.as_str().to_string())]
    }
}

impl Record for BranchInfo {
    const COLLECTION: &'static str = "branches";

    fn key(&self) -> String {
        branch_key(&self.branch_ref())
    }

    fn indexes(&self) -> Vec<(&'static str, String)> {
        vec![(index::branches::REPO, self.repo.to_string())]
    }
}

impl Record for CommitInfo {
    const COLLECTION: &'static str = "commits";

    fn key(&self) -> String {
        commit_key(&self.commit_ref())
    }

    fn indexes(&self) -> Vec<(&'static str, String)> {
        vec![
            (index::commits::REPO, self.repo.to_string()),
            (
                index::commits::BRANCH,
                format!("{}@{}", self.repo, self.branch),
            ),
            (index::commits::COMMIT_SET, self.commit_set.to_string()),
        ]
    }
}

impl Record for PipelineInfo {
    const COLLECTION: &'static str = "pipelines";

    fn key(&self) -> String {
        self.name().to_string()
    }
}

impl Record for JobInfo {
    const COLLECTION: &'static str = "jobs";

    fn key(&self) -> String {
        job_key(&self.pipeline, &self.id)
    }

    fn indexes(&self) -> Vec<(&'static str, String)> {
        vec![
            (index::jobs::PIPELINE, self.pipeline.to_string()),
            (index::jobs::STATE, self.state.as_str().to_string()),
            (
                index::jobs::PIPELINE_STATE,
                job_pipeline_state(&self.pipeline, self.state),
            ),
            (index::jobs::COMMIT_SET, self.id.to_string()),
        ]
    }
}
