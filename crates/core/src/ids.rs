//! Identifier newtypes for repos, branches, commits, and commit-sets.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Maximum length for user-supplied names (repos, branches, pipelines).
pub const MAX_NAME_LEN: usize = 64;

fn validate_name(name: &str) -> std::result::Result<(), String> {
    if name.is_empty() {
        return Err("name cannot be empty".to_string());
    }
    if name.len() > MAX_NAME_LEN {
        return Err(format!(
            "name too long: {} chars (max {MAX_NAME_LEN})",
            name.len()
        ));
    }
    for c in name.chars() {
        if !matches!(c, 'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.') {
            return Err(format!("invalid character in name: {c}"));
        }
    }
    Ok(())
}

/// A repository name.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepoName(String);

impl RepoName {
    /// Create from a string, validating the character set.
    pub fn new(name: impl Into<String>) -> crate::Result<Self> {
        let name = name.into();
        validate_name(&name).map_err(crate::Error::InvalidRepoName)?;
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for RepoName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RepoName({})", self.0)
    }
}

impl fmt::Display for RepoName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RepoName {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::new(s)
    }
}

/// A branch name within a repository.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BranchName(String);

impl BranchName {
    /// Create from a string, validating the character set.
    pub fn new(name: impl Into<String>) -> crate::Result<Self> {
        let name = name.into();
        validate_name(&name).map_err(crate::Error::InvalidBranchName)?;
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for BranchName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BranchName({})", self.0)
    }
}

impl fmt::Display for BranchName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for BranchName {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::new(s)
    }
}

/// A pipeline name. Doubles as the name of the pipeline's output repo.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineName(String);

impl PipelineName {
    /// Create from a string, validating the character set.
    pub fn new(name: impl Into<String>) -> crate::Result<Self> {
        let name = name.into();
        validate_name(&name).map_err(crate::Error::InvalidPipelineName)?;
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The output repo this pipeline writes to.
    pub fn output_repo(&self) -> RepoName {
        RepoName(self.0.clone())
    }

    /// The meta repo holding per-job datum metadata.
    pub fn meta_repo(&self) -> RepoName {
        RepoName(format!("{}.meta", self.0))
    }

    /// The spec repo whose commits hold this pipeline's serialized config.
    pub fn spec_repo(&self) -> RepoName {
        RepoName(format!("{}.spec", self.0))
    }
}

impl fmt::Debug for PipelineName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PipelineName({})", self.0)
    }
}

impl fmt::Display for PipelineName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for PipelineName {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::new(s)
    }
}

/// Unique identifier for a commit.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommitId(Uuid);

impl CommitId {
    /// Generate a new random commit ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from a string (hyphenated or simple form).
    pub fn parse(s: &str) -> crate::Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| crate::Error::InvalidId(format!("invalid commit id: {e}")))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CommitId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommitId({})", self.0.simple())
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Identifier shared by all commits created in one logical transaction.
///
/// A job's id is the commit-set id of its output commit.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommitSetId(Uuid);

impl CommitSetId {
    /// Generate a fresh commit-set ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from a string.
    pub fn parse(s: &str) -> crate::Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| crate::Error::InvalidId(format!("invalid commit-set id: {e}")))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CommitSetId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CommitSetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommitSetId({})", self.0.simple())
    }
}

impl fmt::Display for CommitSetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Unique identifier for a queued task.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskId({})", self.0.simple())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// A `(repo, branch)` pair identifying a branch globally.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BranchRef {
    pub repo: RepoName,
    pub name: BranchName,
}

impl BranchRef {
    pub fn new(repo: RepoName, name: BranchName) -> Self {
        Self { repo, name }
    }

    /// Parse from `repo@branch` form.
    pub fn parse(s: &str) -> crate::Result<Self> {
        let (repo, name) = s
            .split_once('@')
            .ok_or_else(|| crate::Error::InvalidBranchName(format!("expected repo@branch: {s}")))?;
        Ok(Self {
            repo: RepoName::new(repo)?,
            name: BranchName::new(name)?,
        })
    }
}

impl fmt::Debug for BranchRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BranchRef({self})")
    }
}

impl fmt::Display for BranchRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.repo, self.name)
    }
}

/// A `(repo, commit)` pair identifying a commit globally.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommitRef {
    pub repo: RepoName,
    pub id: CommitId,
}

impl CommitRef {
    pub fn new(repo: RepoName, id: CommitId) -> Self {
        Self { repo, id }
    }
}

impl fmt::Debug for CommitRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommitRef({self})")
    }
}

impl fmt::Display for CommitRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.repo, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        assert!(RepoName::new("data").is_ok());
        assert!(RepoName::new("my-repo_2.meta").is_ok());
        assert!(BranchName::new("master").is_ok());
        assert!(PipelineName::new("edges").is_ok());
    }

    #[test]
    fn test_invalid_names() {
        assert!(RepoName::new("").is_err());
        assert!(RepoName::new("has space").is_err());
        assert!(RepoName::new("slash/name").is_err());
        assert!(RepoName::new("a".repeat(65)).is_err());
        assert!(BranchName::new("né").is_err());
    }

    #[test]
    fn test_branch_ref_roundtrip() {
        let b = BranchRef::parse("data@master").unwrap();
        assert_eq!(b.repo.as_str(), "data");
        assert_eq!(b.name.as_str(), "master");
        assert_eq!(b.to_string(), "data@master");
        assert!(BranchRef::parse("no-at-sign").is_err());
    }

    #[test]
    fn test_pipeline_repos() {
        let p = PipelineName::new("edges").unwrap();
        assert_eq!(p.output_repo().as_str(), "edges");
        assert_eq!(p.meta_repo().as_str(), "edges.meta");
    }

    #[test]
    fn test_commit_id_parse() {
        let id = CommitId::new();
        let parsed = CommitId::parse(&id.as_uuid().to_string()).unwrap();
        assert_eq!(id, parsed);
        assert!(CommitId::parse("not-a-uuid").is_err());
    }
}
