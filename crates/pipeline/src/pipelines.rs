//! Pipeline CRUD and the job/datum inspection surface.

use crate::error::{PipelineError, PipelineResult};
use crate::jobs;
use crate::worker::task_group;
use bytes::Bytes;
use time::OffsetDateTime;
use watershed_core::datum::DatumMeta;
use watershed_core::ids::{BranchName, BranchRef, CommitSetId, PipelineName};
use watershed_core::{
    CommitInfo, JobInfo, PipelineConfig, PipelineInfo, PipelineState, RepoType,
};
use watershed_graph::{CommitGraph, FileOp};
use watershed_metadata::domain::job_key;
use watershed_metadata::{Order, TaskQueue, TaskState, WatchFilter};

fn master() -> BranchName {
    "master".parse().expect("master is a valid branch name")
}

/// Create a pipeline, or update it in place.
///
/// An update with a byte-identical config is a no-op: no version bump, no
/// salt rotation, no new spec commit. An effective change bumps the version,
/// rotates the salt, writes a new spec commit, and (through output-branch
/// provenance) starts a fresh commit-set.
pub async fn create_pipeline(
    graph: &CommitGraph,
    config: PipelineConfig,
    update: bool,
) -> PipelineResult<PipelineInfo> {
    config.validate()?;
    let name = config.name.clone();

    let existing = graph
        .store()
        .try_get::<PipelineInfo>(name.as_str())
        .await?;
    if let Some(existing) = &existing {
        if !update {
            return Err(PipelineError::AlreadyExists(format!("pipeline {name}")));
        }
        if existing.config == config {
            return Ok(existing.clone());
        }
    }
    let version = existing.as_ref().map(|e| e.version + 1).unwrap_or(1);
    let salt = watershed_core::pipeline::new_salt();

    // inputs must exist before we wire provenance onto them
    let input_branches = config.input.referenced_branches();
    for branch in &input_branches {
        graph.inspect_repo(&branch.repo).await?;
    }

    // On update, bump version and salt before the new spec commit lands:
    // finishing that commit starts the next job, and its controller must
    // already observe the new identity.
    if let Some(existing) = &existing {
        let bumped = PipelineInfo {
            config: config.clone(),
            version,
            salt: salt.clone(),
            spec_commit: existing.spec_commit.clone(),
            state: PipelineState::Starting,
            reason: String::new(),
            stopped: existing.stopped,
            created_at: existing.created_at,
            updated_at: OffsetDateTime::now_utc(),
        };
        graph
            .store()
            .transact(move |tx| {
                let bumped = bumped.clone();
                Box::pin(async move {
                    tx.put(&bumped).await?;
                    Ok::<_, PipelineError>(())
                })
            })
            .await?;
    }

    // the spec commit: a versioned record of this exact config
    let spec_repo = name.spec_repo();
    graph
        .create_repo(
            spec_repo.clone(),
            RepoType::Spec,
            format!("spec history of pipeline {name}"),
            true,
        )
        .await?;
    let spec_branch = BranchRef::new(spec_repo.clone(), master());
    let spec_commit = graph
        .start_commit(spec_branch.clone(), None, format!("version {version}"))
        .await?;
    graph
        .modify_file(
            &spec_repo,
            &spec_commit.id.to_string(),
            vec![FileOp::Add {
                path: "/spec.json".to_string(),
                data: Bytes::from(serde_json::to_vec(&config)?),
            }],
        )
        .await?;
    let spec_commit = graph
        .finish_commit(&spec_repo, &spec_commit.id.to_string(), None, false)
        .await?;

    // output and meta repos; the meta branch must exist before the output
    // branch so propagation finds it once output commits start finishing
    graph
        .create_repo(
            name.output_repo(),
            RepoType::Output,
            config.description.clone(),
            true,
        )
        .await?;
    graph
        .create_repo(
            name.meta_repo(),
            RepoType::Meta,
            format!("datum metadata of pipeline {name}"),
            true,
        )
        .await?;
    let output_branch = BranchRef::new(name.output_repo(), master());
    graph
        .create_branch(
            BranchRef::new(name.meta_repo(), master()),
            None,
            vec![output_branch.clone()],
            None,
            false,
        )
        .await?;

    let info = PipelineInfo {
        config,
        version,
        salt,
        spec_commit: spec_commit.commit_ref(),
        state: PipelineState::Starting,
        reason: String::new(),
        stopped: false,
        created_at: existing
            .as_ref()
            .map(|e| e.created_at)
            .unwrap_or_else(OffsetDateTime::now_utc),
        updated_at: OffsetDateTime::now_utc(),
    };
    graph
        .store()
        .transact(move |tx| {
            let info = info.clone();
            Box::pin(async move {
                tx.put(&info).await?;
                Ok::<_, PipelineError>(info)
            })
        })
        .await?;

    // wiring provenance last: this propagates, which may create the first
    // output commit and with it the first job
    let mut provenance = input_branches;
    provenance.push(spec_branch);
    graph
        .create_branch(output_branch, None, provenance, None, false)
        .await?;

    let info = graph.store().get::<PipelineInfo>(name.as_str()).await?;
    Ok(info)
}

pub async fn inspect_pipeline(
    graph: &CommitGraph,
    name: &PipelineName,
) -> PipelineResult<PipelineInfo> {
    graph
        .store()
        .try_get(name.as_str())
        .await?
        .ok_or_else(|| PipelineError::PipelineNotFound(name.clone()))
}

pub async fn list_pipeline(graph: &CommitGraph) -> PipelineResult<Vec<PipelineInfo>> {
    Ok(graph.store().list(Order::Asc).await?)
}

/// Delete a pipeline: its jobs, task groups, and derived repos cascade.
pub async fn delete_pipeline(
    graph: &CommitGraph,
    queue: &TaskQueue,
    name: &PipelineName,
) -> PipelineResult<()> {
    let pipeline = inspect_pipeline(graph, name).await?;

    for job in jobs::list_jobs(graph, name).await? {
        queue.purge_group(&task_group(name, job.id)).await?;
    }
    let key_prefix = format!("{name}@");
    let name_owned = name.clone();
    graph
        .store()
        .transact(move |tx| {
            let key_prefix = key_prefix.clone();
            let name = name_owned.clone();
            Box::pin(async move {
                tx.delete_prefix::<JobInfo>(&key_prefix).await?;
                if tx.try_get::<PipelineInfo>(name.as_str()).await?.is_some() {
                    tx.delete::<PipelineInfo>(name.as_str()).await?;
                }
                Ok::<_, PipelineError>(())
            })
        })
        .await?;

    graph.delete_repo(&pipeline.name().meta_repo(), true).await?;
    graph.delete_repo(&pipeline.name().output_repo(), true).await?;
    graph.delete_repo(&pipeline.name().spec_repo(), true).await?;
    Ok(())
}

/// Resume a stopped pipeline.
pub async fn start_pipeline(graph: &CommitGraph, name: &PipelineName) -> PipelineResult<()> {
    set_stopped(graph, name, false).await
}

/// Pause a pipeline; its controller kills in-flight work and creates no new
/// jobs until restarted.
pub async fn stop_pipeline(graph: &CommitGraph, name: &PipelineName) -> PipelineResult<()> {
    set_stopped(graph, name, true).await
}

async fn set_stopped(
    graph: &CommitGraph,
    name: &PipelineName,
    stopped: bool,
) -> PipelineResult<()> {
    let name = name.clone();
    graph
        .store()
        .transact(move |tx| {
            let name = name.clone();
            Box::pin(async move {
                let mut pipeline: PipelineInfo =
                    tx.try_get(name.as_str()).await?.ok_or_else(|| {
                        PipelineError::PipelineNotFound(name.clone())
                    })?;
                if pipeline.stopped != stopped {
                    pipeline.stopped = stopped;
                    pipeline.state = if stopped {
                        PipelineState::Paused
                    } else {
                        PipelineState::Starting
                    };
                    pipeline.updated_at = OffsetDateTime::now_utc();
                    tx.put(&pipeline).await?;
                }
                Ok::<_, PipelineError>(())
            })
        })
        .await
}

/// Force a new run over the current input heads by opening a fresh
/// commit-set on the output branch.
pub async fn run_pipeline(graph: &CommitGraph, name: &PipelineName) -> PipelineResult<CommitSetId> {
    inspect_pipeline(graph, name).await?;
    let branch = BranchRef::new(name.output_repo(), master());
    let set = CommitSetId::new();
    graph.propagate_branch(branch, set).await?;
    Ok(set)
}

/// Fetch a job; with `wait`, block until it reaches a terminal state.
pub async fn inspect_job(
    graph: &CommitGraph,
    pipeline: &PipelineName,
    id: CommitSetId,
    wait: bool,
) -> PipelineResult<JobInfo> {
    let job = jobs::get_job(graph, pipeline, id).await?;
    if !wait || job.state.is_terminal() {
        return Ok(job);
    }
    let key = job_key(pipeline, &id);
    let mut watcher = graph
        .store()
        .watch::<JobInfo>(WatchFilter::Key(key.clone()));
    let job = jobs::get_job(graph, pipeline, id).await?;
    if job.state.is_terminal() {
        return Ok(job);
    }
    loop {
        match watcher.next().await {
            Ok(event) => {
                if event.record.state.is_terminal() {
                    return Ok(event.record);
                }
            }
            Err(watershed_metadata::MetadataError::WatchLagged) => {
                let job = jobs::get_job(graph, pipeline, id).await?;
                if job.state.is_terminal() {
                    return Ok(job);
                }
                watcher = graph.store().watch(WatchFilter::Key(key.clone()));
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Per-datum results of a finished job, in datum-id order.
pub async fn list_datum(
    graph: &CommitGraph,
    pipeline: &PipelineName,
    id: CommitSetId,
) -> PipelineResult<Vec<DatumMeta>> {
    let job = jobs::get_job(graph, pipeline, id).await?;
    let Some(meta_commit) = &job.meta_commit else {
        return Err(PipelineError::Precondition(format!(
            "job {pipeline}@{id} has no datum metadata yet (state {})",
            job.state.as_str()
        )));
    };
    let commit: CommitInfo = graph
        .resolve_commit(&meta_commit.repo, &meta_commit.id.to_string())
        .await?;
    let manifest = graph.commit_manifest(&commit).await?;
    if manifest.get("/datums.json").is_none() {
        return Ok(Vec::new());
    }
    let data = graph.filesets().read_file(&manifest, "/datums.json").await?;
    Ok(serde_json::from_slice(&data)?)
}

pub async fn inspect_datum(
    graph: &CommitGraph,
    pipeline: &PipelineName,
    id: CommitSetId,
    datum_id: &str,
) -> PipelineResult<DatumMeta> {
    list_datum(graph, pipeline, id)
        .await?
        .into_iter()
        .find(|meta| meta.datum.id == datum_id)
        .ok_or_else(|| PipelineError::DatumNotFound(datum_id.to_string()))
}

/// Put a running job's datum back up for grabs: the batch holding it is
/// released to the queue so another worker re-executes it.
pub async fn restart_datum(
    graph: &CommitGraph,
    queue: &TaskQueue,
    pipeline: &PipelineName,
    id: CommitSetId,
    datum_id: &str,
) -> PipelineResult<()> {
    let job = jobs::get_job(graph, pipeline, id).await?;
    if job.state.is_terminal() {
        return Err(PipelineError::Precondition(format!(
            "job {pipeline}@{id} is already {}",
            job.state.as_str()
        )));
    }
    let group = task_group(pipeline, id);
    for state in [TaskState::Claimed, TaskState::Pending] {
        for task in queue.list_state(&group, state).await? {
            let batch: crate::worker::DatumBatch =
                match serde_json::from_value(task.payload.clone()) {
                    Ok(batch) => batch,
                    Err(_) => continue,
                };
            if batch.datums.iter().any(|d| d.id == datum_id) {
                if state == TaskState::Claimed {
                    queue.release(&task).await?;
                }
                return Ok(());
            }
        }
    }
    Err(PipelineError::DatumNotFound(datum_id.to_string()))
}

/// Kill a running job explicitly.
pub async fn stop_job(
    graph: &CommitGraph,
    queue: &TaskQueue,
    pipeline_name: &PipelineName,
    id: CommitSetId,
) -> PipelineResult<JobInfo> {
    let pipeline = inspect_pipeline(graph, pipeline_name).await?;
    let job = jobs::get_job(graph, pipeline_name, id).await?;
    if job.state.is_terminal() {
        return Ok(job);
    }
    queue.purge_group(&task_group(pipeline_name, id)).await?;
    jobs::finish_job(
        graph,
        &pipeline,
        id,
        crate::jobs::JobOutcome {
            state: watershed_core::JobState::Killed,
            reason: "job killed: stopped by user".to_string(),
            output: None,
            meta: None,
            totals: crate::jobs::JobTotals::default(),
        },
    )
    .await
}
