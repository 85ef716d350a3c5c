//! Branch types and trigger rules.

use crate::ids::{BranchName, BranchRef, CommitId, RepoName};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

/// A rule that auto-advances a branch head when a source branch in the same
/// repo satisfies its conditions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    /// Branch (same repo) whose advancement is evaluated.
    pub source_branch: BranchName,
    /// Rate schedule in `@every <duration>` form, e.g. `@every 10m`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_spec: Option<String>,
    /// Minimum new-data size since the last trigger point, e.g. `100MB`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    /// Minimum number of new commits since the last trigger point.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commits: Option<u64>,
    /// Require all set conditions to hold; otherwise any one suffices.
    #[serde(default)]
    pub all: bool,
}

impl Trigger {
    /// Validate the rule shape. At least one condition must be set.
    pub fn validate(&self) -> crate::Result<()> {
        if self.cron_spec.is_none() && self.size.is_none() && self.commits.is_none() {
            return Err(crate::Error::InvalidTrigger(
                "trigger needs at least one of cron_spec, size, commits".to_string(),
            ));
        }
        if let Some(spec) = &self.cron_spec {
            parse_rate_spec(spec)?;
        }
        if let Some(size) = &self.size {
            parse_size(size)?;
        }
        if self.commits == Some(0) {
            return Err(crate::Error::InvalidTrigger(
                "commits condition must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse an `@every <duration>` rate spec into a duration.
///
/// Supported suffixes: `s`, `m`, `h`, `d`.
pub fn parse_rate_spec(spec: &str) -> crate::Result<Duration> {
    let body = spec
        .strip_prefix("@every ")
        .ok_or_else(|| crate::Error::InvalidTrigger(format!("unsupported cron spec: {spec}")))?;
    let body = body.trim();
    let split = body
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| crate::Error::InvalidTrigger(format!("missing unit in {spec:?}")))?;
    let (num, unit) = body.split_at(split);
    let n: i64 = num
        .parse()
        .map_err(|_| crate::Error::InvalidTrigger(format!("bad duration in {spec:?}")))?;
    if n <= 0 {
        return Err(crate::Error::InvalidTrigger(format!(
            "duration must be positive in {spec:?}"
        )));
    }
    match unit {
        "s" => Ok(Duration::seconds(n)),
        "m" => Ok(Duration::minutes(n)),
        "h" => Ok(Duration::hours(n)),
        "d" => Ok(Duration::days(n)),
        _ => Err(crate::Error::InvalidTrigger(format!(
            "unknown unit {unit:?} in {spec:?}"
        ))),
    }
}

/// Parse a human size string ("4096", "10KB", "1MiB", "2GB") into bytes.
pub fn parse_size(s: &str) -> crate::Result<u64> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (num, unit) = s.split_at(split);
    let n: u64 = num
        .parse()
        .map_err(|_| crate::Error::InvalidSize(s.to_string()))?;
    let mult: u64 = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "KB" => 1000,
        "MB" => 1000 * 1000,
        "GB" => 1000 * 1000 * 1000,
        "KIB" => 1024,
        "MIB" => 1024 * 1024,
        "GIB" => 1024 * 1024 * 1024,
        _ => return Err(crate::Error::InvalidSize(s.to_string())),
    };
    n.checked_mul(mult)
        .ok_or_else(|| crate::Error::InvalidSize(s.to_string()))
}

/// A branch: a named moving pointer within a repository.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BranchInfo {
    pub repo: RepoName,
    pub name: BranchName,
    /// Current head commit, if the branch has any.
    pub head: Option<CommitId>,
    /// Branches this branch reads from. Propagation materializes a commit
    /// here whenever one of these advances.
    #[serde(default)]
    pub direct_provenance: Vec<BranchRef>,
    /// Derived inverse of `direct_provenance`, maintained transactionally.
    #[serde(default)]
    pub subvenance: Vec<BranchRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<Trigger>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl BranchInfo {
    pub fn new(repo: RepoName, name: BranchName) -> Self {
        Self {
            repo,
            name,
            head: None,
            direct_provenance: Vec::new(),
            subvenance: Vec::new(),
            trigger: None,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn branch_ref(&self) -> BranchRef {
        BranchRef::new(self.repo.clone(), self.name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rate_spec() {
        assert_eq!(parse_rate_spec("@every 30s").unwrap(), Duration::seconds(30));
        assert_eq!(parse_rate_spec("@every 10m").unwrap(), Duration::minutes(10));
        assert_eq!(parse_rate_spec("@every 2h").unwrap(), Duration::hours(2));
        assert!(parse_rate_spec("0 * * * *").is_err());
        assert!(parse_rate_spec("@every -5s").is_err());
        assert!(parse_rate_spec("@every 5y").is_err());
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("10KB").unwrap(), 10_000);
        assert_eq!(parse_size("1MiB").unwrap(), 1024 * 1024);
        assert_eq!(parse_size("2GB").unwrap(), 2_000_000_000);
        assert!(parse_size("lots").is_err());
        assert!(parse_size("10XB").is_err());
    }

    #[test]
    fn test_trigger_validate() {
        let t = Trigger {
            source_branch: BranchName::new("staging").unwrap(),
            cron_spec: None,
            size: None,
            commits: None,
            all: false,
        };
        assert!(t.validate().is_err());

        let t = Trigger {
            commits: Some(3),
            ..t
        };
        assert!(t.validate().is_ok());
    }
}
