//! Repository types.

use crate::ids::RepoName;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// What kind of data a repository holds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoType {
    /// Ordinary user data.
    #[default]
    User,
    /// Serialized pipeline specs, one branch per pipeline.
    Spec,
    /// Per-job datum metadata written by pipeline controllers.
    Meta,
    /// Output of a pipeline; commits on it are finished by the controller.
    Output,
}

impl RepoType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Spec => "spec",
            Self::Meta => "meta",
            Self::Output => "output",
        }
    }

    /// Commits on repos of this type are left open by propagation and
    /// finished by the owning pipeline controller.
    pub fn finished_by_controller(&self) -> bool {
        matches!(self, Self::Output | Self::Meta)
    }
}

/// A repository: a named namespace of commits and branches.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RepoInfo {
    pub name: RepoName,
    #[serde(rename = "type")]
    pub typ: RepoType,
    #[serde(default)]
    pub description: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// Sum of the finished sizes of current branch heads. Upper bound, not
    /// deduplicated across branches.
    #[serde(default)]
    pub size_bytes_upper_bound: u64,
}

impl RepoInfo {
    pub fn new(name: RepoName, typ: RepoType, description: impl Into<String>) -> Self {
        Self {
            name,
            typ,
            description: description.into(),
            created_at: OffsetDateTime::now_utc(),
            size_bytes_upper_bound: 0,
        }
    }
}
