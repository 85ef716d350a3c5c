//! Pipeline configuration and lifecycle state.

use crate::ids::{CommitRef, PipelineName};
use crate::input::Input;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use time::OffsetDateTime;

/// The containerized command a pipeline runs per datum.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub image: String,
    /// Argv; `cmd[0]` is the executable.
    pub cmd: Vec<String>,
    /// Lines fed to the command's stdin.
    #[serde(default)]
    pub stdin: Vec<String>,
    /// Recovery hook run after `cmd` exhausts its tries; success marks the
    /// datum recovered instead of failed.
    #[serde(default)]
    pub err_cmd: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub secrets: Vec<String>,
}

/// Resource hints passed through to the orchestrator.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<u64>,
}

/// User-supplied pipeline definition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub name: PipelineName,
    pub input: Input,
    pub transform: Transform,
    /// Target worker replica count.
    #[serde(default = "default_parallelism")]
    pub parallelism: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_requests: Option<ResourceSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_limits: Option<ResourceSpec>,
    /// Per-datum wall-clock budget in seconds; 0 means unlimited.
    #[serde(default)]
    pub datum_timeout_secs: u64,
    /// Attempts per datum before it counts as failed.
    #[serde(default = "default_datum_tries")]
    pub datum_tries: u32,
    /// Per-job wall-clock budget in seconds; 0 means unlimited.
    #[serde(default)]
    pub job_timeout_secs: u64,
    /// Copy finished output filesets to this target after each job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub egress: Option<String>,
    /// Keep processing the current job when newer input arrives instead of
    /// killing it.
    #[serde(default)]
    pub deferred_processing: bool,
    /// Scale workers to zero while no output commits are pending.
    #[serde(default)]
    pub autoscaling: bool,
    #[serde(default)]
    pub description: String,
}

fn default_parallelism() -> u32 {
    1
}

fn default_datum_tries() -> u32 {
    3
}

impl PipelineConfig {
    /// Validate the config shape.
    pub fn validate(&self) -> crate::Result<()> {
        self.input.validate()?;
        if self.transform.cmd.is_empty() {
            return Err(crate::Error::InvalidInput(
                "transform.cmd cannot be empty".to_string(),
            ));
        }
        if self.parallelism == 0 {
            return Err(crate::Error::InvalidInput(
                "parallelism must be at least 1".to_string(),
            ));
        }
        if self.datum_tries == 0 {
            return Err(crate::Error::InvalidInput(
                "datum_tries must be at least 1".to_string(),
            ));
        }
        for leaf in self.input.leaves() {
            if leaf.repo.as_str() == self.name.as_str() {
                return Err(crate::Error::InvalidInput(format!(
                    "pipeline {} cannot read from its own output repo",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// Pipeline lifecycle state, driven by the controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    /// Controller is coming up.
    Starting,
    /// Controller is live and processing or awaiting commits.
    Running,
    /// Explicitly stopped; no jobs are created.
    Paused,
    /// Permanent error; spec must change before jobs resume.
    Failure,
    /// Workers are repeatedly failing to come up.
    Crashing,
    /// Scaled to zero while no output commits are pending.
    Standby,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Failure => "failure",
            Self::Crashing => "crashing",
            Self::Standby => "standby",
        }
    }
}

/// A registered pipeline: config plus controller-owned bookkeeping.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineInfo {
    pub config: PipelineConfig,
    /// Monotonically increasing; bumped on every effective spec change.
    pub version: u64,
    /// Re-randomized on each spec change to fence worker identity.
    pub salt: String,
    /// Commit on the spec repo holding the serialized config.
    pub spec_commit: CommitRef,
    pub state: PipelineState,
    /// Why the pipeline is in `Failure`/`Crashing`, if it is.
    #[serde(default)]
    pub reason: String,
    /// Paused by `StopPipeline`.
    #[serde(default)]
    pub stopped: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl PipelineInfo {
    pub fn name(&self) -> &PipelineName {
        &self.config.name
    }
}

/// Generate a fresh pipeline salt (16 random bytes, hex).
pub fn new_salt() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{BranchName, RepoName};
    use crate::input::PfsInput;

    fn config(name: &str, input_repo: &str) -> PipelineConfig {
        PipelineConfig {
            name: PipelineName::new(name).unwrap(),
            input: Input::Pfs(PfsInput {
                name: String::new(),
                repo: RepoName::new(input_repo).unwrap(),
                branch: BranchName::new("master").unwrap(),
                glob: "/*".to_string(),
                join_on: None,
                group_by: None,
                lazy: false,
                empty_files: false,
                s3: false,
            }),
            transform: Transform {
                image: "busybox".to_string(),
                cmd: vec!["sh".to_string(), "-c".to_string(), "true".to_string()],
                ..Transform::default()
            },
            parallelism: 1,
            resource_requests: None,
            resource_limits: None,
            datum_timeout_secs: 0,
            datum_tries: 3,
            job_timeout_secs: 0,
            egress: None,
            deferred_processing: false,
            autoscaling: false,
            description: String::new(),
        }
    }

    #[test]
    fn test_validate_ok() {
        assert!(config("edges", "images").validate().is_ok());
    }

    #[test]
    fn test_rejects_self_input() {
        assert!(config("edges", "edges").validate().is_err());
    }

    #[test]
    fn test_rejects_empty_cmd() {
        let mut c = config("edges", "images");
        c.transform.cmd.clear();
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_salt_is_unique() {
        let a = new_salt();
        let b = new_salt();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }
}
