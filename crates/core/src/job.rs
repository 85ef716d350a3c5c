//! Job records: one pipeline run producing one output commit.

use crate::ids::{CommitRef, CommitSetId, PipelineName};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Job lifecycle state.
///
/// Terminal states are `Success`, `Failure`, `Killed`, and `Unrunnable`.
/// Every transition is written in the same metadata transaction as the
/// matching output-commit update.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Job row exists; output commit open; no worker activity yet.
    Created,
    /// Controller is planning datums and provisioning workers.
    Starting,
    /// Datum batches are being dispatched.
    Running,
    /// All datums done; output is being published to the egress target.
    Egressing,
    /// Output commit finished without error.
    Success,
    /// A datum exhausted its tries or provisioning failed fatally.
    Failure,
    /// Superseded by a newer commit-set, or the pipeline was stopped.
    Killed,
    /// Input provenance already carried an error; nothing was executed.
    Unrunnable,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Egressing => "egressing",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Killed => "killed",
            Self::Unrunnable => "unrunnable",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failure | Self::Killed | Self::Unrunnable
        )
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Created, Starting)
                | (Created, Unrunnable)
                | (Created, Killed)
                | (Starting, Running)
                | (Starting, Unrunnable)
                | (Starting, Failure)
                | (Starting, Killed)
                | (Running, Egressing)
                | (Running, Success)
                | (Running, Failure)
                | (Running, Killed)
                | (Egressing, Success)
                | (Egressing, Failure)
                | (Egressing, Killed)
                // a controller that died mid-egress re-dispatches; the
                // batch results lived in the purged task queue
                | (Egressing, Running)
        )
    }
}

/// Per-datum wall-clock and byte accounting, aggregated onto the job.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessStats {
    pub download_ms: u64,
    pub process_ms: u64,
    pub upload_ms: u64,
    pub download_bytes: u64,
    pub upload_bytes: u64,
}

impl ProcessStats {
    pub fn merge(&mut self, other: &ProcessStats) {
        self.download_ms += other.download_ms;
        self.process_ms += other.process_ms;
        self.upload_ms += other.upload_ms;
        self.download_bytes += other.download_bytes;
        self.upload_bytes += other.upload_bytes;
    }
}

/// Terminal state of one datum within a job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatumState {
    Success,
    /// Exhausted its tries.
    Failed,
    /// Output copied forward from the previous job.
    Skipped,
    /// The recovery hook succeeded after the command failed.
    Recovered,
}

impl DatumState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Recovered => "recovered",
        }
    }
}

/// One pipeline run. The job id is the commit-set id of its output commit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobInfo {
    pub pipeline: PipelineName,
    pub id: CommitSetId,
    pub pipeline_version: u64,
    pub output_commit: CommitRef,
    /// Commit on the meta repo holding per-datum metadata. Created when the
    /// output commit finishes, so absent until the job is finalized.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta_commit: Option<CommitRef>,
    pub state: JobState,
    /// Failure reason for terminal error states.
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub data_total: u64,
    #[serde(default)]
    pub data_processed: u64,
    #[serde(default)]
    pub data_skipped: u64,
    #[serde(default)]
    pub data_failed: u64,
    #[serde(default)]
    pub data_recovered: u64,
    #[serde(default)]
    pub stats: ProcessStats,
    /// Times the controller re-dispatched after losing a worker.
    #[serde(default)]
    pub restart: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub started_at: Option<OffsetDateTime>,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub finished_at: Option<OffsetDateTime>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(JobState::Success.is_terminal());
        assert!(JobState::Killed.is_terminal());
        assert!(JobState::Unrunnable.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(!JobState::Created.is_terminal());
    }

    #[test]
    fn test_legal_transitions() {
        assert!(JobState::Created.can_transition_to(JobState::Starting));
        assert!(JobState::Created.can_transition_to(JobState::Unrunnable));
        assert!(JobState::Running.can_transition_to(JobState::Killed));
        assert!(JobState::Egressing.can_transition_to(JobState::Success));
        assert!(!JobState::Success.can_transition_to(JobState::Running));
        assert!(!JobState::Created.can_transition_to(JobState::Success));
        assert!(!JobState::Unrunnable.can_transition_to(JobState::Killed));
    }

    #[test]
    fn test_stats_merge() {
        let mut a = ProcessStats {
            download_ms: 1,
            process_ms: 2,
            upload_ms: 3,
            download_bytes: 10,
            upload_bytes: 20,
        };
        a.merge(&a.clone());
        assert_eq!(a.process_ms, 4);
        assert_eq!(a.upload_bytes, 40);
    }
}
