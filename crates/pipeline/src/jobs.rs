//! The job state machine.
//!
//! Every transition that finishes the job also finishes its output and meta
//! commits inside the same metadata transaction, so no observer can see a
//! finished commit with an unfinished job or the reverse.

use crate::error::{PipelineError, PipelineResult};
use time::OffsetDateTime;
use watershed_core::ids::{CommitSetId, PipelineName};
use watershed_core::{CommitInfo, FilesetId, JobInfo, JobState, PipelineInfo, ProcessStats};
use watershed_graph::{finish_commit_tx, CommitGraph, GraphError};
use watershed_metadata::domain::{index, job_key};

/// Counters and aggregates carried into a terminal transition.
#[derive(Clone, Debug, Default)]
pub struct JobTotals {
    pub data_total: u64,
    pub data_processed: u64,
    pub data_skipped: u64,
    pub data_failed: u64,
    pub data_recovered: u64,
    pub stats: ProcessStats,
}

/// A terminal outcome: the job state plus the finished content.
#[derive(Clone, Debug)]
pub struct JobOutcome {
    pub state: JobState,
    /// Empty for success; the commit error otherwise.
    pub reason: String,
    /// Output fileset and its byte size; `None` finishes the commit empty.
    pub output: Option<(FilesetId, u64)>,
    /// Meta fileset (datum metadata) and its byte size.
    pub meta: Option<(FilesetId, u64)>,
    pub totals: JobTotals,
}

/// Create the job row for an output commit if none exists yet.
pub async fn ensure_job(
    graph: &CommitGraph,
    pipeline: &PipelineInfo,
    output_commit: &CommitInfo,
) -> PipelineResult<JobInfo> {
    let job = JobInfo {
        pipeline: pipeline.name().clone(),
        id: output_commit.commit_set,
        pipeline_version: pipeline.version,
        output_commit: output_commit.commit_ref(),
        meta_commit: None,
        state: JobState::Created,
        reason: String::new(),
        data_total: 0,
        data_processed: 0,
        data_skipped: 0,
        data_failed: 0,
        data_recovered: 0,
        stats: ProcessStats::default(),
        restart: 0,
        created_at: OffsetDateTime::now_utc(),
        started_at: None,
        finished_at: None,
    };
    graph
        .store()
        .transact(move |tx| {
            let job = job.clone();
            Box::pin(async move {
                let key = job_key(&job.pipeline, &job.id);
                if let Some(existing) = tx.try_get::<JobInfo>(&key).await? {
                    return Ok(existing);
                }
                tx.insert(&job).await?;
                Ok::<_, PipelineError>(job)
            })
        })
        .await
}

/// Advance a job through a non-terminal state, optionally patching counters.
pub async fn update_job(
    graph: &CommitGraph,
    pipeline: &PipelineName,
    id: CommitSetId,
    state: JobState,
    patch: impl Fn(&mut JobInfo) + Send + Sync + 'static,
) -> PipelineResult<JobInfo> {
    if state.is_terminal() {
        return Err(PipelineError::Precondition(format!(
            "terminal state {} requires finish_job",
            state.as_str()
        )));
    }
    let key = job_key(pipeline, &id);
    let pipeline = pipeline.clone();
    let patch = std::sync::Arc::new(patch);
    graph
        .store()
        .transact(move |tx| {
            let key = key.clone();
            let pipeline = pipeline.clone();
            let patch = patch.clone();
            Box::pin(async move {
                let mut job: JobInfo = tx.try_get(&key).await?.ok_or_else(|| {
                    PipelineError::JobNotFound {
                        pipeline: pipeline.clone(),
                        id,
                    }
                })?;
                if job.state != state {
                    if !job.state.can_transition_to(state) {
                        return Err(PipelineError::InvalidTransition {
                            from: job.state.as_str().to_string(),
                            to: state.as_str().to_string(),
                        });
                    }
                    job.state = state;
                    if state == JobState::Starting && job.started_at.is_none() {
                        job.started_at = Some(OffsetDateTime::now_utc());
                    }
                }
                patch(&mut job);
                tx.put(&job).await?;
                Ok(job)
            })
        })
        .await
}

/// Finish a job: job row, output commit, and meta commit in one transaction.
///
/// Content sizes are precomputed by the caller; the transaction only moves
/// pointers. Finishing an already-terminal job is a no-op returning the
/// existing row.
pub async fn finish_job(
    graph: &CommitGraph,
    pipeline: &PipelineInfo,
    id: CommitSetId,
    outcome: JobOutcome,
) -> PipelineResult<JobInfo> {
    if !outcome.state.is_terminal() {
        return Err(PipelineError::Precondition(format!(
            "finish_job requires a terminal state, got {}",
            outcome.state.as_str()
        )));
    }
    let key = job_key(pipeline.name(), &id);
    let empty = graph.empty_fileset().clone();
    let meta_repo = pipeline.name().meta_repo();
    let pipeline_name = pipeline.name().clone();
    graph
        .store()
        .transact(move |tx| {
            let key = key.clone();
            let empty = empty.clone();
            let meta_repo = meta_repo.clone();
            let pipeline_name = pipeline_name.clone();
            let outcome = outcome.clone();
            Box::pin(async move {
                let mut job: JobInfo = tx.try_get(&key).await?.ok_or_else(|| {
                    PipelineError::JobNotFound {
                        pipeline: pipeline_name.clone(),
                        id,
                    }
                })?;
                if job.state.is_terminal() {
                    return Ok(job);
                }
                if !job.state.can_transition_to(outcome.state)
                    && !matches!(outcome.state, JobState::Killed | JobState::Failure)
                {
                    return Err(PipelineError::InvalidTransition {
                        from: job.state.as_str().to_string(),
                        to: outcome.state.as_str().to_string(),
                    });
                }

                let commit_error =
                    (!outcome.reason.is_empty()).then(|| outcome.reason.clone());
                let (output_fileset, output_size) = match &outcome.output {
                    Some((fileset, size)) => (Some(fileset.clone()), *size),
                    None => (Some(empty.clone()), 0),
                };
                match finish_commit_tx(
                    tx,
                    &empty,
                    &job.output_commit,
                    output_fileset,
                    output_size,
                    commit_error.clone(),
                    false,
                )
                .await
                {
                    Ok(_) => {}
                    // lockstep crash recovery: the commit may already be done
                    Err(GraphError::CommitFinished(_)) => {}
                    Err(e) => return Err(e.into()),
                }

                // finishing the output commit propagated a fresh open meta
                // commit into this set; seal the datum metadata into it
                let set_commits: Vec<CommitInfo> = tx
                    .get_by_index(index::commits::COMMIT_SET, &id.to_string())
                    .await?;
                if let Some(meta_commit) =
                    set_commits.iter().find(|c| c.repo == meta_repo && c.is_open())
                {
                    let (meta_fileset, meta_size) = match &outcome.meta {
                        Some((fileset, size)) => (Some(fileset.clone()), *size),
                        None => (Some(empty.clone()), 0),
                    };
                    finish_commit_tx(
                        tx,
                        &empty,
                        &meta_commit.commit_ref(),
                        meta_fileset,
                        meta_size,
                        commit_error,
                        false,
                    )
                    .await?;
                    job.meta_commit = Some(meta_commit.commit_ref());
                }

                job.state = outcome.state;
                job.reason = outcome.reason.clone();
                job.data_total = outcome.totals.data_total;
                job.data_processed = outcome.totals.data_processed;
                job.data_skipped = outcome.totals.data_skipped;
                job.data_failed = outcome.totals.data_failed;
                job.data_recovered = outcome.totals.data_recovered;
                job.stats = outcome.totals.stats;
                job.finished_at = Some(OffsetDateTime::now_utc());
                tx.put(&job).await?;
                Ok(job)
            })
        })
        .await
}

/// Fetch a job row.
pub async fn get_job(
    graph: &CommitGraph,
    pipeline: &PipelineName,
    id: CommitSetId,
) -> PipelineResult<JobInfo> {
    graph
        .store()
        .try_get(&job_key(pipeline, &id))
        .await?
        .ok_or_else(|| PipelineError::JobNotFound {
            pipeline: pipeline.clone(),
            id,
        })
}

/// Jobs of one pipeline, newest first.
pub async fn list_jobs(
    graph: &CommitGraph,
    pipeline: &PipelineName,
) -> PipelineResult<Vec<JobInfo>> {
    let mut jobs: Vec<JobInfo> = graph
        .store()
        .get_by_index(index::jobs::PIPELINE, pipeline.as_str())
        .await?;
    jobs.reverse();
    Ok(jobs)
}
