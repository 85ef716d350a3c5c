//! Commit types: immutable filesystem snapshots forming a DAG.

use crate::fileset::FilesetId;
use crate::ids::{BranchName, CommitId, CommitRef, CommitSetId, RepoName};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// How a commit came to exist.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitOrigin {
    /// Started explicitly by a client.
    #[default]
    User,
    /// Created by branch propagation.
    Auto,
    /// Stand-in pointing at the same content as its parent, created so a
    /// commit-set covers every provenance branch.
    Alias,
    /// Created by consistency repair.
    Fsck,
}

impl CommitOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Auto => "auto",
            Self::Alias => "alias",
            Self::Fsck => "fsck",
        }
    }
}

/// An immutable snapshot of a repository's filesystem.
///
/// A commit is open until `finished` is set; `fileset` names the full
/// content once finished (and the staged content while open).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommitInfo {
    pub repo: RepoName,
    pub id: CommitId,
    /// Branch this commit was opened against.
    pub branch: BranchName,
    /// Previous commit on the same branch, if any.
    pub parent: Option<CommitId>,
    /// Commits parented on this one. Maintained for squash reparenting.
    #[serde(default)]
    pub children: Vec<CommitId>,
    pub commit_set: CommitSetId,
    pub origin: CommitOrigin,
    /// Heads of the branch's direct provenance at creation time. All belong
    /// to `commit_set`.
    #[serde(default)]
    pub direct_provenance: Vec<CommitRef>,
    #[serde(with = "time::serde::rfc3339")]
    pub started: OffsetDateTime,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub finished: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fileset: Option<FilesetId>,
    /// Non-empty iff the commit failed.
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub description: String,
}

impl CommitInfo {
    pub fn commit_ref(&self) -> CommitRef {
        CommitRef::new(self.repo.clone(), self.id)
    }

    pub fn is_open(&self) -> bool {
        self.finished.is_none()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_some()
    }

    pub fn has_error(&self) -> bool {
        !self.error.is_empty()
    }
}

/// Derived view of all commits sharing one commit-set id.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommitSetInfo {
    pub id: CommitSetId,
    pub commits: Vec<CommitInfo>,
}

impl CommitSetInfo {
    /// A commit-set is finished when every member commit is finished.
    pub fn is_finished(&self) -> bool {
        self.commits.iter().all(CommitInfo::is_finished)
    }

    /// Finished with no member carrying an error.
    pub fn is_successful(&self) -> bool {
        self.is_finished() && !self.commits.iter().any(CommitInfo::has_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{BranchName, RepoName};

    fn commit(error: &str, finished: bool) -> CommitInfo {
        CommitInfo {
            repo: RepoName::new("r").unwrap(),
            id: CommitId::new(),
            branch: BranchName::new("master").unwrap(),
            parent: None,
            children: Vec::new(),
            commit_set: CommitSetId::new(),
            origin: CommitOrigin::User,
            direct_provenance: Vec::new(),
            started: OffsetDateTime::now_utc(),
            finished: finished.then(OffsetDateTime::now_utc),
            size_bytes: None,
            fileset: None,
            error: error.to_string(),
            description: String::new(),
        }
    }

    #[test]
    fn test_commit_set_states() {
        let set = CommitSetInfo {
            id: CommitSetId::new(),
            commits: vec![commit("", true), commit("", false)],
        };
        assert!(!set.is_finished());
        assert!(!set.is_successful());

        let set = CommitSetInfo {
            id: CommitSetId::new(),
            commits: vec![commit("", true), commit("boom", true)],
        };
        assert!(set.is_finished());
        assert!(!set.is_successful());

        let set = CommitSetInfo {
            id: CommitSetId::new(),
            commits: vec![commit("", true)],
        };
        assert!(set.is_successful());
    }
}
