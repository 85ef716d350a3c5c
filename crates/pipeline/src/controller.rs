//! The per-pipeline controller loop.
//!
//! One controller is live per pipeline across the fleet, guarded by a TTL
//! lease keyed on the pipeline name. It turns open output commits into
//! jobs, dispatches datum batches through the task queue, and finalizes
//! output commits, at-least-once end to end.

use crate::error::{PipelineError, PipelineResult};
use crate::jobs::{ensure_job, finish_job, update_job, JobOutcome, JobTotals};
use crate::planner::{diff_datums, plan_datums, DatumDiff};
use crate::worker::{task_group, BatchResult, DatumBatch};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;
use watershed_core::config::OrchestrationConfig;
use watershed_core::datum::DatumMeta;
use watershed_core::ids::PipelineName;
use watershed_core::{
    CommitInfo, DatumState, FilesetId, JobInfo, JobState, PipelineInfo, PipelineState,
};
use watershed_graph::CommitGraph;
use watershed_metadata::{lease, MetadataStore, TaskQueue, TaskState};

/// Pause between idle iterations, and the completion-poll fallback.
const IDLE_WAIT: Duration = Duration::from_millis(250);

/// Consecutive iteration failures before the pipeline is marked failed.
/// The controller keeps retrying; a later success clears the state.
const FAILURE_THRESHOLD: u32 = 5;

/// Outcome of one controller iteration.
enum Iterated {
    /// A job was processed (or idle work was done); go again immediately.
    Worked,
    /// Nothing to do; sleep before the next pass.
    Idle,
    /// The pipeline row is gone; the controller exits.
    Gone,
}

/// Shared dependencies handed to every controller.
#[derive(Clone)]
pub struct ControllerContext {
    pub graph: Arc<CommitGraph>,
    pub store: Arc<MetadataStore>,
    pub queue: TaskQueue,
    pub config: OrchestrationConfig,
    /// Egress targets resolve relative to this root when not absolute.
    pub egress_root: PathBuf,
}

pub struct PipelineController {
    name: PipelineName,
    ctx: ControllerContext,
    /// Lease identity; unique per controller incarnation.
    holder: String,
}

impl PipelineController {
    pub fn spawn(
        name: PipelineName,
        ctx: ControllerContext,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let holder = format!("{name}/{}", Uuid::new_v4().simple());
        let controller = Self { name, ctx, holder };
        tokio::spawn(controller.run(shutdown))
    }

    fn lease_name(&self) -> String {
        format!("controller/{}", self.name)
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(pipeline = %self.name, "Controller started");
        let lease_ttl = Duration::from_secs(self.ctx.config.master_lease_secs);
        let mut failures = 0u32;
        loop {
            if *shutdown.borrow() {
                break;
            }
            let held = match lease::acquire(
                &self.ctx.store,
                &self.lease_name(),
                &self.holder,
                lease_ttl,
            )
            .await
            {
                Ok(held) => held,
                Err(e) => {
                    tracing::warn!(pipeline = %self.name, error = %e, "Lease acquisition failed");
                    false
                }
            };
            if !held {
                tokio::select! {
                    _ = tokio::time::sleep(lease_ttl) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }

            match self.iteration(&mut shutdown).await {
                Ok(Iterated::Worked) => failures = 0,
                Ok(Iterated::Idle) => {
                    failures = 0;
                    tokio::select! {
                        _ = tokio::time::sleep(IDLE_WAIT) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Ok(Iterated::Gone) => break,
                Err(e) => {
                    failures += 1;
                    let backoff = compute_backoff(&self.ctx.config, failures);
                    tracing::error!(
                        pipeline = %self.name,
                        error = %e,
                        failures = failures,
                        backoff_ms = backoff.as_millis() as u64,
                        "Controller iteration failed"
                    );
                    if failures >= FAILURE_THRESHOLD {
                        let _ = self
                            .set_state(PipelineState::Failure, &e.to_string())
                            .await;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
        let _ = lease::release(&self.ctx.store, &self.lease_name(), &self.holder).await;
        tracing::info!(pipeline = %self.name, "Controller stopped");
    }

    async fn iteration(&self, shutdown: &mut watch::Receiver<bool>) -> PipelineResult<Iterated> {
        let Some(pipeline) = self
            .ctx
            .store
            .try_get::<PipelineInfo>(self.name.as_str())
            .await?
        else {
            return Ok(Iterated::Gone);
        };

        if pipeline.stopped {
            self.set_state(PipelineState::Paused, "").await?;
            // a stopped pipeline kills whatever is still in flight
            if let Some(job) = self.oldest_pending_job(&pipeline).await? {
                if !job.state.is_terminal() {
                    self.kill_job(&pipeline, &job, "pipeline stopped").await?;
                    return Ok(Iterated::Worked);
                }
            }
            return Ok(Iterated::Idle);
        }

        let Some(job) = self.oldest_pending_job(&pipeline).await? else {
            let idle_state = if pipeline.config.autoscaling {
                PipelineState::Standby
            } else {
                PipelineState::Running
            };
            self.set_state(idle_state, "").await?;
            return Ok(Iterated::Idle);
        };

        self.set_state(PipelineState::Running, "").await?;
        self.process_job(&pipeline, job, shutdown).await?;
        Ok(Iterated::Worked)
    }

    /// The oldest non-terminal job, creating job rows for any open output
    /// commits that lack one.
    async fn oldest_pending_job(
        &self,
        pipeline: &PipelineInfo,
    ) -> PipelineResult<Option<JobInfo>> {
        let output_repo = self.name.output_repo();
        let commits = self
            .ctx
            .graph
            .list_commit(&output_repo, None, None, true)
            .await?;
        for commit in commits {
            if !commit.is_open() {
                continue;
            }
            let job = ensure_job(&self.ctx.graph, pipeline, &commit).await?;
            if !job.state.is_terminal() {
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    async fn process_job(
        &self,
        pipeline: &PipelineInfo,
        mut job: JobInfo,
        shutdown: &mut watch::Receiver<bool>,
    ) -> PipelineResult<()> {
        let Some(output_commit) = self
            .ctx
            .store
            .try_get::<CommitInfo>(&watershed_metadata::domain::commit_key(&job.output_commit))
            .await?
        else {
            // squashed out from under us together with its job row
            return Ok(());
        };
        tracing::info!(
            pipeline = %self.name,
            job = %job.id,
            state = job.state.as_str(),
            "Processing job"
        );

        // provenance that already failed never runs a transform
        let mut provenance = Vec::new();
        for upstream_ref in &output_commit.direct_provenance {
            let upstream = self
                .ctx
                .graph
                .resolve_commit(&upstream_ref.repo, &upstream_ref.id.to_string())
                .await?;
            if upstream.has_error() {
                finish_job(
                    &self.ctx.graph,
                    pipeline,
                    job.id,
                    JobOutcome {
                        state: JobState::Unrunnable,
                        reason: format!(
                            "provenance commit {} failed: {}",
                            upstream.commit_ref(),
                            upstream.error
                        ),
                        output: None,
                        meta: None,
                        totals: JobTotals::default(),
                    },
                )
                .await?;
                return Ok(());
            }
            provenance.push(upstream);
        }

        let group = task_group(&self.name, job.id);
        if job.state != JobState::Created {
            // a prior controller died mid-job; restart the dispatch cleanly
            self.ctx.queue.purge_group(&group).await?;
            job = update_job(
                &self.ctx.graph,
                &self.name,
                job.id,
                job.state,
                |job| job.restart += 1,
            )
            .await?;
        }

        // plan
        let previous = self.previous_success_metas(pipeline).await?;
        let planned = plan_datums(
            self.ctx.graph.filesets(),
            &pipeline.salt,
            &pipeline.config.input,
            &provenance,
        )
        .await?;
        let DatumDiff {
            fresh,
            skip,
            removed,
        } = diff_datums(planned, &previous);
        let data_total = (fresh.len() + skip.len()) as u64;
        let data_skipped = skip.len() as u64;
        tracing::debug!(
            pipeline = %self.name,
            job = %job.id,
            fresh = fresh.len(),
            skipped = skip.len(),
            removed = removed,
            "Planned datums"
        );

        if job.state == JobState::Created {
            update_job(&self.ctx.graph, &self.name, job.id, JobState::Starting, move |job| {
                job.data_total = data_total;
                job.data_skipped = data_skipped;
            })
            .await?;
        }

        // dispatch
        let batch_slots = (pipeline.config.parallelism * self.ctx.config.batch_factor).max(1);
        let batch_size = (fresh.len().div_ceil(batch_slots as usize)).max(1);
        let mut expected_tasks = 0u64;
        for chunk in fresh.chunks(batch_size) {
            let batch = DatumBatch {
                pipeline: self.name.clone(),
                job: job.id,
                pipeline_version: pipeline.version,
                salt: pipeline.salt.clone(),
                transform: pipeline.config.transform.clone(),
                datum_timeout_secs: pipeline.config.datum_timeout_secs,
                datum_tries: pipeline.config.datum_tries,
                datums: chunk.to_vec(),
            };
            self.ctx
                .queue
                .enqueue(&group, serde_json::to_value(&batch)?)
                .await?;
            expected_tasks += 1;
        }
        update_job(&self.ctx.graph, &self.name, job.id, JobState::Running, |_| {}).await?;

        // await completions, watching for supersession and spec changes
        let wait = self
            .await_batches(pipeline, &job, &group, expected_tasks, shutdown)
            .await?;
        let (done, failed_tasks) = match wait {
            BatchWait::Complete { done, failed } => (done, failed),
            BatchWait::Killed { reason } => {
                self.kill_job(pipeline, &job, &reason).await?;
                return Ok(());
            }
            BatchWait::TimedOut => {
                self.ctx.queue.purge_group(&group).await?;
                finish_job(
                    &self.ctx.graph,
                    pipeline,
                    job.id,
                    JobOutcome {
                        state: JobState::Failure,
                        reason: format!(
                            "job timed out after {}s",
                            pipeline.config.job_timeout_secs
                        ),
                        output: None,
                        meta: None,
                        totals: JobTotals {
                            data_total,
                            data_skipped,
                            ..JobTotals::default()
                        },
                    },
                )
                .await?;
                return Ok(());
            }
        };

        // aggregate
        let mut metas: Vec<DatumMeta> = skip;
        for task_result in done {
            metas.extend(task_result.metas);
        }
        let mut totals = JobTotals {
            data_total,
            data_skipped,
            ..JobTotals::default()
        };
        let mut first_failure: Option<String> = None;
        for meta in &metas {
            match meta.state {
                DatumState::Success => totals.data_processed += 1,
                DatumState::Recovered => totals.data_recovered += 1,
                DatumState::Skipped => {}
                DatumState::Failed => {
                    totals.data_failed += 1;
                    if first_failure.is_none() {
                        first_failure = Some(format!(
                            "datum {} failed after {} tries: {}",
                            &meta.datum.id[..16.min(meta.datum.id.len())],
                            meta.tries,
                            meta.error
                        ));
                    }
                }
            }
            totals.stats.merge(&meta.stats);
        }
        if let Some(infra) = failed_tasks.first() {
            first_failure.get_or_insert_with(|| format!("batch dispatch failed: {infra}"));
            totals.data_failed += 1;
        }

        let meta_content = self.write_meta_fileset(&metas).await?;
        let outcome = if totals.data_failed > 0 {
            let reason = first_failure.unwrap_or_else(|| "datums failed".to_string());
            if reason.contains("failed to spawn") {
                self.set_state(PipelineState::Crashing, &reason).await?;
            }
            JobOutcome {
                state: JobState::Failure,
                reason,
                output: None,
                meta: Some(meta_content),
                totals,
            }
        } else {
            let output = self.compose_output(&metas).await?;
            if let Some(egress) = &pipeline.config.egress {
                update_job(&self.ctx.graph, &self.name, job.id, JobState::Egressing, |_| {})
                    .await?;
                self.export_output(egress, &output.0).await?;
            }
            JobOutcome {
                state: JobState::Success,
                reason: String::new(),
                output: Some(output),
                meta: Some(meta_content),
                totals,
            }
        };

        let finished = finish_job(&self.ctx.graph, pipeline, job.id, outcome).await?;
        self.ctx.queue.purge_group(&group).await?;
        tracing::info!(
            pipeline = %self.name,
            job = %job.id,
            state = finished.state.as_str(),
            processed = finished.data_processed,
            skipped = finished.data_skipped,
            failed = finished.data_failed,
            "Job finished"
        );
        Ok(())
    }

    /// Wait until every dispatched batch reaches a terminal task state, or
    /// the job is superseded/stopped/timed out.
    async fn await_batches(
        &self,
        pipeline: &PipelineInfo,
        job: &JobInfo,
        group: &str,
        expected: u64,
        shutdown: &mut watch::Receiver<bool>,
    ) -> PipelineResult<BatchWait> {
        let started = OffsetDateTime::now_utc();
        let mut wake = self.ctx.queue.watch(group);
        loop {
            let done = self.ctx.queue.list_state(group, TaskState::Done).await?;
            let failed = self.ctx.queue.list_state(group, TaskState::Failed).await?;
            if done.len() as u64 + failed.len() as u64 >= expected {
                let mut results = Vec::with_capacity(done.len());
                for task in done {
                    let result: BatchResult = match task.result {
                        Some(value) => serde_json::from_value(value)?,
                        None => BatchResult::default(),
                    };
                    results.push(result);
                }
                let failures: Vec<String> = failed
                    .into_iter()
                    .filter_map(|task| task.error)
                    .collect();
                return Ok(BatchWait::Complete {
                    done: results,
                    failed: failures,
                });
            }

            if *shutdown.borrow() {
                return Ok(BatchWait::Killed {
                    reason: "controller shutting down".to_string(),
                });
            }
            let current = self
                .ctx
                .store
                .try_get::<PipelineInfo>(self.name.as_str())
                .await?;
            match &current {
                None => {
                    return Ok(BatchWait::Killed {
                        reason: "pipeline deleted".to_string(),
                    })
                }
                Some(p) if p.stopped => {
                    return Ok(BatchWait::Killed {
                        reason: "pipeline stopped".to_string(),
                    })
                }
                Some(p) if p.version != pipeline.version => {
                    return Ok(BatchWait::Killed {
                        reason: format!("superseded by pipeline version {}", p.version),
                    })
                }
                Some(_) => {}
            }
            if !pipeline.config.deferred_processing {
                if let Some(newer) = self.newer_commit_set(job).await? {
                    return Ok(BatchWait::Killed {
                        reason: format!("superseded by commit set {newer}"),
                    });
                }
            }
            if pipeline.config.job_timeout_secs > 0 {
                let elapsed = OffsetDateTime::now_utc() - started;
                if elapsed.whole_seconds() as u64 >= pipeline.config.job_timeout_secs {
                    return Ok(BatchWait::TimedOut);
                }
            }

            match tokio::time::timeout(IDLE_WAIT, wake.next()).await {
                Ok(Ok(_)) => {}
                Ok(Err(_)) => wake = self.ctx.queue.watch(group),
                Err(_) => {}
            }
        }
    }

    /// A newer open output commit than this job's, if one exists.
    async fn newer_commit_set(
        &self,
        job: &JobInfo,
    ) -> PipelineResult<Option<watershed_core::ids::CommitSetId>> {
        let commits = self
            .ctx
            .graph
            .list_commit(&self.name.output_repo(), None, None, true)
            .await?;
        let mut saw_ours = false;
        for commit in commits {
            if commit.id == job.output_commit.id {
                saw_ours = true;
                continue;
            }
            if saw_ours && commit.is_open() {
                return Ok(Some(commit.commit_set));
            }
        }
        Ok(None)
    }

    async fn kill_job(
        &self,
        pipeline: &PipelineInfo,
        job: &JobInfo,
        reason: &str,
    ) -> PipelineResult<()> {
        self.ctx
            .queue
            .purge_group(&task_group(&self.name, job.id))
            .await?;
        finish_job(
            &self.ctx.graph,
            pipeline,
            job.id,
            JobOutcome {
                state: JobState::Killed,
                reason: format!("job killed: {reason}"),
                output: None,
                meta: None,
                totals: JobTotals::default(),
            },
        )
        .await?;
        tracing::info!(pipeline = %self.name, job = %job.id, reason = reason, "Job killed");
        Ok(())
    }

    /// Datum metas of the most recent successful job, for the skip pass.
    async fn previous_success_metas(
        &self,
        pipeline: &PipelineInfo,
    ) -> PipelineResult<Vec<DatumMeta>> {
        let jobs = crate::jobs::list_jobs(&self.ctx.graph, pipeline.name()).await?;
        for job in jobs {
            if job.state != JobState::Success {
                continue;
            }
            let Some(meta_commit) = &job.meta_commit else {
                continue;
            };
            let commit = self
                .ctx
                .graph
                .resolve_commit(&meta_commit.repo, &meta_commit.id.to_string())
                .await?;
            return self.read_meta_file(&commit).await;
        }
        Ok(Vec::new())
    }

    async fn read_meta_file(&self, commit: &CommitInfo) -> PipelineResult<Vec<DatumMeta>> {
        let manifest = self.ctx.graph.commit_manifest(commit).await?;
        if manifest.get("/datums.json").is_none() {
            return Ok(Vec::new());
        }
        let data = self
            .ctx
            .graph
            .filesets()
            .read_file(&manifest, "/datums.json")
            .await?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Persist the job's datum metadata as a fileset for the next run.
    async fn write_meta_fileset(
        &self,
        metas: &[DatumMeta],
    ) -> PipelineResult<(FilesetId, u64)> {
        let mut sorted: Vec<&DatumMeta> = metas.iter().collect();
        sorted.sort_by(|a, b| a.datum.id.cmp(&b.datum.id));
        let data = serde_json::to_vec(&sorted)?;
        let size = data.len() as u64;
        let mut manifest = watershed_storage::Manifest::new();
        self.ctx
            .graph
            .filesets()
            .put_file(&mut manifest, "/datums.json", data.into())
            .await?;
        let fileset = self.ctx.graph.filesets().write_manifest(&manifest).await?;
        Ok((fileset, size))
    }

    /// Merge per-datum output filesets into the job's output, in datum-id
    /// order so composition is deterministic.
    async fn compose_output(&self, metas: &[DatumMeta]) -> PipelineResult<(FilesetId, u64)> {
        let mut layers: Vec<(String, FilesetId)> = metas
            .iter()
            .filter_map(|meta| {
                meta.output
                    .clone()
                    .map(|output| (meta.datum.id.clone(), output))
            })
            .collect();
        layers.sort_by(|a, b| a.0.cmp(&b.0));
        let ids: Vec<FilesetId> = layers.into_iter().map(|(_, id)| id).collect();
        let composed = self.ctx.graph.filesets().compose(&ids).await?;
        let size = self
            .ctx
            .graph
            .filesets()
            .read_manifest(&composed)
            .await?
            .size_bytes();
        Ok((composed, size))
    }

    /// Copy the finished output tree to the egress target directory.
    async fn export_output(&self, target: &str, output: &FilesetId) -> PipelineResult<()> {
        let target = target.strip_prefix("file://").unwrap_or(target);
        let root = if std::path::Path::new(target).is_absolute() {
            PathBuf::from(target)
        } else {
            self.ctx.egress_root.join(target)
        };
        let manifest = self.ctx.graph.filesets().read_manifest(output).await?;
        for file in manifest.walk("/")? {
            let data = self
                .ctx
                .graph
                .filesets()
                .read_file(&manifest, &file.path)
                .await?;
            let dest = root.join(file.path.trim_start_matches('/'));
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&dest, &data).await?;
        }
        tracing::debug!(target = %root.display(), "Egressed output fileset");
        Ok(())
    }

    async fn set_state(&self, state: PipelineState, reason: &str) -> PipelineResult<()> {
        let name = self.name.clone();
        let reason = reason.to_string();
        self.ctx
            .store
            .transact(move |tx| {
                let name = name.clone();
                let reason = reason.clone();
                Box::pin(async move {
                    let Some(mut pipeline) = tx.try_get::<PipelineInfo>(name.as_str()).await?
                    else {
                        return Ok(());
                    };
                    if pipeline.state != state || pipeline.reason != reason {
                        pipeline.state = state;
                        pipeline.reason = reason;
                        pipeline.updated_at = OffsetDateTime::now_utc();
                        tx.put(&pipeline).await?;
                    }
                    Ok::<_, PipelineError>(())
                })
            })
            .await
    }
}

enum BatchWait {
    Complete {
        done: Vec<BatchResult>,
        failed: Vec<String>,
    },
    Killed {
        reason: String,
    },
    TimedOut,
}

fn compute_backoff(config: &OrchestrationConfig, failures: u32) -> Duration {
    let base = config.backoff_base_ms.max(1);
    let ms = base.saturating_mul(2u64.saturating_pow(failures.saturating_sub(1)));
    Duration::from_millis(ms.min(config.backoff_max_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_to_cap() {
        let config = OrchestrationConfig::default();
        assert_eq!(compute_backoff(&config, 1), Duration::from_millis(250));
        assert_eq!(compute_backoff(&config, 2), Duration::from_millis(500));
        assert_eq!(compute_backoff(&config, 20), Duration::from_millis(30_000));
    }
}
