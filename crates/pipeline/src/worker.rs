//! The worker runtime: executes datum batches from the task queue.

use crate::error::{PipelineError, PipelineResult};
use crate::runtime::{ContainerRuntime, MountSpec, RunSpec};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use watershed_core::datum::{Datum, DatumMeta};
use watershed_core::ids::{CommitSetId, PipelineName};
use watershed_core::{DatumState, JobInfo, ProcessStats, Transform};
use watershed_metadata::domain::index;
use watershed_metadata::{MetadataStore, TaskQueue, TaskRecord};
use watershed_storage::{FilesetStore, Manifest};

/// How long an idle worker sleeps before polling the queue again.
const IDLE_POLL: Duration = Duration::from_millis(100);

/// One dispatched unit of work: a slice of a job's datums plus everything
/// needed to execute them without further lookups.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatumBatch {
    pub pipeline: PipelineName,
    pub job: CommitSetId,
    pub pipeline_version: u64,
    pub salt: String,
    pub transform: Transform,
    pub datum_timeout_secs: u64,
    pub datum_tries: u32,
    pub datums: Vec<Datum>,
}

/// Per-datum results reported back through the task queue.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BatchResult {
    pub metas: Vec<DatumMeta>,
}

/// Queue group carrying a job's batches.
pub fn task_group(pipeline: &PipelineName, job: CommitSetId) -> String {
    format!("datums/{pipeline}/{job}")
}

/// A worker: claims batches, materializes inputs, runs the transform, and
/// archives outputs. Crashing mid-batch releases the task lease and another
/// worker picks the batch up.
pub struct Worker {
    id: String,
    store: Arc<MetadataStore>,
    queue: TaskQueue,
    filesets: FilesetStore,
    runtime: Arc<dyn ContainerRuntime>,
    scratch_root: PathBuf,
    lease: Duration,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        store: Arc<MetadataStore>,
        filesets: FilesetStore,
        runtime: Arc<dyn ContainerRuntime>,
        scratch_root: PathBuf,
        lease: Duration,
    ) -> Self {
        Self {
            id: id.into(),
            queue: TaskQueue::new(store.clone()),
            store,
            filesets,
            runtime,
            scratch_root,
            lease,
        }
    }

    /// Run until `shutdown` flips true.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(worker = %self.id, "Worker started");
            loop {
                if *shutdown.borrow() {
                    break;
                }
                match self.step().await {
                    Ok(true) => {}
                    Ok(false) => {
                        tokio::select! {
                            _ = tokio::time::sleep(IDLE_POLL) => {}
                            _ = shutdown.changed() => {}
                        }
                    }
                    Err(e) => {
                        tracing::warn!(worker = %self.id, error = %e, "Worker step failed");
                        tokio::time::sleep(IDLE_POLL).await;
                    }
                }
            }
            tracing::info!(worker = %self.id, "Worker stopped");
        })
    }

    /// Claim and process at most one batch. Returns whether work was found.
    async fn step(&self) -> PipelineResult<bool> {
        let running: Vec<JobInfo> = self
            .store
            .get_by_index(index::jobs::STATE, "running")
            .await?;
        for job in running {
            let group = task_group(&job.pipeline, job.id);
            let Some(task) = self.queue.claim(&group, &self.id, self.lease).await? else {
                continue;
            };
            self.run_task(task).await?;
            return Ok(true);
        }
        Ok(false)
    }

    async fn run_task(&self, task: TaskRecord) -> PipelineResult<()> {
        let batch: DatumBatch = match serde_json::from_value(task.payload.clone()) {
            Ok(batch) => batch,
            Err(e) => {
                self.queue
                    .fail(&task, format!("undecodable batch payload: {e}"))
                    .await?;
                return Ok(());
            }
        };
        tracing::debug!(
            worker = %self.id,
            pipeline = %batch.pipeline,
            job = %batch.job,
            datums = batch.datums.len(),
            "Processing batch"
        );

        let mut result = BatchResult::default();
        for datum in &batch.datums {
            // hold the lease across long transforms
            if self.queue.renew(&task, self.lease).await.is_err() {
                tracing::warn!(
                    worker = %self.id,
                    task = %task.id,
                    "Lost task lease mid-batch; abandoning"
                );
                return Ok(());
            }
            let meta = self.process_datum(&batch, datum).await;
            result.metas.push(meta);
        }
        self.queue
            .complete(&task, serde_json::to_value(&result)?)
            .await?;
        Ok(())
    }

    /// Execute one datum with the batch's retry policy. Never propagates a
    /// user failure as an error: failures land in the returned meta so one
    /// bad datum cannot poison its batch peers.
    async fn process_datum(&self, batch: &DatumBatch, datum: &Datum) -> DatumMeta {
        let scratch = self
            .scratch_root
            .join(format!("{}-{}", self.id, &datum.id[..16]));
        let result = self.try_datum(batch, datum, &scratch).await;
        if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(scratch = %scratch.display(), error = %e, "Scratch cleanup failed");
            }
        }
        match result {
            Ok(meta) => meta,
            Err(e) => DatumMeta {
                datum: datum.clone(),
                state: DatumState::Failed,
                stats: ProcessStats::default(),
                output: None,
                tries: batch.datum_tries,
                error: e.to_string(),
            },
        }
    }

    async fn try_datum(
        &self,
        batch: &DatumBatch,
        datum: &Datum,
        scratch: &Path,
    ) -> PipelineResult<DatumMeta> {
        let pfs = scratch.join("pfs");
        let out_dir = pfs.join("out");

        let download_started = Instant::now();
        tokio::fs::create_dir_all(&out_dir).await?;
        let download_bytes = self.materialize(&pfs, datum).await?;
        let download_ms = download_started.elapsed().as_millis() as u64;

        let timeout = (batch.datum_timeout_secs > 0)
            .then(|| Duration::from_secs(batch.datum_timeout_secs));
        let mounts = vec![MountSpec {
            host_path: pfs.clone(),
            container_path: "/pfs".to_string(),
            readonly: false,
        }];
        let mut env = batch.transform.env.clone();
        env.insert("WATERSHED_PIPELINE".to_string(), batch.pipeline.to_string());
        env.insert("WATERSHED_JOB_ID".to_string(), batch.job.to_string());
        env.insert("WATERSHED_DATUM_ID".to_string(), datum.id.clone());

        let process_started = Instant::now();
        let mut tries = 0u32;
        let mut last_error = String::new();
        let mut succeeded = false;
        while tries < batch.datum_tries {
            tries += 1;
            let run = self
                .runtime
                .run(RunSpec {
                    image: batch.transform.image.clone(),
                    cmd: batch.transform.cmd.clone(),
                    stdin: batch.transform.stdin.clone(),
                    env: env.clone(),
                    mounts: mounts.clone(),
                    timeout,
                })
                .await;
            match run {
                Ok(result) if result.success() => {
                    succeeded = true;
                    break;
                }
                Ok(result) => {
                    last_error = if result.timed_out {
                        format!("datum timed out after {}s", batch.datum_timeout_secs)
                    } else {
                        format!(
                            "exit code {}: {}",
                            result.exit_code,
                            tail(&result.stderr)
                        )
                    };
                    tracing::debug!(
                        datum = %datum.id,
                        attempt = tries,
                        error = %last_error,
                        "Datum attempt failed"
                    );
                }
                Err(e) => {
                    last_error = e.to_string();
                    tracing::debug!(
                        datum = %datum.id,
                        attempt = tries,
                        error = %last_error,
                        "Datum attempt failed to launch"
                    );
                }
            }
        }
        let process_ms = process_started.elapsed().as_millis() as u64;

        if !succeeded {
            // the recovery hook gets one shot at downgrading the failure
            if !batch.transform.err_cmd.is_empty() {
                let recovery = self
                    .runtime
                    .run(RunSpec {
                        image: batch.transform.image.clone(),
                        cmd: batch.transform.err_cmd.clone(),
                        stdin: Vec::new(),
                        env: env.clone(),
                        mounts: mounts.clone(),
                        timeout,
                    })
                    .await;
                if matches!(recovery, Ok(result) if result.success()) {
                    return Ok(DatumMeta {
                        datum: datum.clone(),
                        state: DatumState::Recovered,
                        stats: ProcessStats {
                            download_ms,
                            process_ms,
                            upload_ms: 0,
                            download_bytes,
                            upload_bytes: 0,
                        },
                        output: None,
                        tries,
                        error: last_error,
                    });
                }
            }
            return Ok(DatumMeta {
                datum: datum.clone(),
                state: DatumState::Failed,
                stats: ProcessStats {
                    download_ms,
                    process_ms,
                    upload_ms: 0,
                    download_bytes,
                    upload_bytes: 0,
                },
                output: None,
                tries,
                error: last_error,
            });
        }

        let upload_started = Instant::now();
        let (output, upload_bytes) = self.collect_output(&out_dir).await?;
        let upload_ms = upload_started.elapsed().as_millis() as u64;

        Ok(DatumMeta {
            datum: datum.clone(),
            state: DatumState::Success,
            stats: ProcessStats {
                download_ms,
                process_ms,
                upload_ms,
                download_bytes,
                upload_bytes,
            },
            output: Some(output),
            tries,
            error: String::new(),
        })
    }

    /// Lay the datum's input files out under `pfs/<name>/<path>`. Lazy and
    /// empty-file inputs become zero-byte placeholders.
    async fn materialize(&self, pfs: &Path, datum: &Datum) -> PipelineResult<u64> {
        let mut bytes = 0u64;
        for input in &datum.inputs {
            let manifest = self.filesets.read_manifest(&input.fileset).await?;
            for file in manifest.walk(&input.file.path)? {
                let relative = file.path.trim_start_matches('/');
                let target = pfs.join(input.name.as_str()).join(relative);
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                if input.lazy || input.empty_files {
                    tokio::fs::write(&target, b"").await?;
                } else {
                    let data = self.filesets.read_file(&manifest, &file.path).await?;
                    bytes += data.len() as u64;
                    tokio::fs::write(&target, &data).await?;
                }
            }
        }
        Ok(bytes)
    }

    /// Archive everything under the output directory into a fileset.
    async fn collect_output(&self, out_dir: &Path) -> PipelineResult<(watershed_core::FilesetId, u64)> {
        let mut manifest = Manifest::new();
        let mut bytes = 0u64;
        let mut stack = vec![out_dir.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    stack.push(path);
                    continue;
                }
                let data = tokio::fs::read(&path).await?;
                bytes += data.len() as u64;
                let relative = path
                    .strip_prefix(out_dir)
                    .map_err(|e| PipelineError::Transform(e.to_string()))?
                    .to_string_lossy()
                    .replace('\\', "/");
                self.filesets
                    .put_file(&mut manifest, &format!("/{relative}"), data.into())
                    .await?;
            }
        }
        let fileset = self.filesets.write_manifest(&manifest).await?;
        Ok((fileset, bytes))
    }
}

fn tail(text: &str) -> String {
    const MAX: usize = 512;
    if text.len() <= MAX {
        text.trim_end().to_string()
    } else {
        format!("...{}", &text[text.len() - MAX..].trim_end())
    }
}
