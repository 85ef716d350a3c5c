//! In-process cluster harness: metadata store, chunk storage, commit graph,
//! orchestrator with real workers, and the axum router.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use watershed_core::config::AppConfig;
use watershed_core::ids::{BranchRef, PipelineName, RepoName};
use watershed_core::input::PfsInput;
use watershed_core::{CommitInfo, Input, JobInfo, PipelineConfig, RepoType, Transform};
use watershed_graph::{CommitGraph, FileOp};
use watershed_metadata::MetadataStore;
use watershed_pipeline::{LocalRunner, Orchestrator};
use watershed_server::AppState;
use watershed_storage::{FilesetStore, FilesystemBackend};

/// Ceiling for every wait helper.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct TestCluster {
    pub state: AppState,
    _dir: tempfile::TempDir,
}

impl TestCluster {
    pub async fn start() -> Self {
        let dir = tempfile::tempdir().expect("create test dir");
        let config = AppConfig::for_testing(dir.path());

        let store = Arc::new(MetadataStore::open_in_memory().await.expect("open store"));
        let chunks = FilesystemBackend::new(dir.path().join("chunks"))
            .await
            .expect("open chunk storage");
        let filesets = FilesetStore::new(Arc::new(chunks));
        let graph = Arc::new(
            CommitGraph::new(store.clone(), filesets)
                .await
                .expect("init graph"),
        );
        let orchestrator = Orchestrator::new(
            graph.clone(),
            store.clone(),
            config.orchestration.clone(),
            Arc::new(LocalRunner::new()),
            dir.path().join("work"),
        );
        orchestrator.start().await.expect("start orchestrator");

        Self {
            state: AppState::new(config, store, graph, orchestrator),
            _dir: dir,
        }
    }

    pub fn graph(&self) -> &Arc<CommitGraph> {
        &self.state.graph
    }

    pub async fn create_repo(&self, name: &str) -> RepoName {
        let name = RepoName::new(name).unwrap();
        self.graph()
            .create_repo(name.clone(), RepoType::User, String::new(), false)
            .await
            .unwrap();
        name
    }

    /// Start a commit, write files, finish it.
    pub async fn put_files(
        &self,
        repo: &str,
        branch: &str,
        files: &[(&str, &[u8])],
    ) -> CommitInfo {
        let branch = BranchRef::parse(&format!("{repo}@{branch}")).unwrap();
        let commit = self
            .graph()
            .start_commit(branch.clone(), None, String::new())
            .await
            .unwrap();
        let ops = files
            .iter()
            .map(|(path, data)| FileOp::Add {
                path: path.to_string(),
                data: Bytes::copy_from_slice(data),
            })
            .collect();
        self.graph()
            .modify_file(&branch.repo, &commit.id.to_string(), ops)
            .await
            .unwrap();
        self.graph()
            .finish_commit(&branch.repo, &commit.id.to_string(), None, false)
            .await
            .unwrap()
    }

    pub async fn read_file(&self, repo: &str, reference: &str, path: &str) -> Bytes {
        let repo = RepoName::new(repo).unwrap();
        self.graph()
            .get_file(&repo, reference, path, 0, None)
            .await
            .unwrap()
    }

    /// Register a pipeline and make sure its controller is live.
    pub async fn create_pipeline(&self, config: PipelineConfig) -> PipelineName {
        let name = config.name.clone();
        watershed_pipeline::pipelines::create_pipeline(self.graph(), config, false)
            .await
            .unwrap();
        self.state.orchestrator.ensure_controller(name.clone()).await;
        name
    }

    /// Wait until some job of the pipeline satisfies the predicate.
    pub async fn wait_job(
        &self,
        pipeline: &PipelineName,
        pred: impl Fn(&JobInfo) -> bool,
    ) -> JobInfo {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        loop {
            let jobs = watershed_pipeline::jobs::list_jobs(self.graph(), pipeline)
                .await
                .unwrap();
            if let Some(job) = jobs.iter().find(|job| pred(job)) {
                return job.clone();
            }
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for job of {pipeline}: {jobs:?}");
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Wait until the head of `repo@branch` is a finished commit.
    pub async fn wait_finished_head(&self, repo: &str, branch: &str) -> CommitInfo {
        let repo = RepoName::new(repo).unwrap();
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        loop {
            if let Ok(commit) = self.graph().resolve_commit(&repo, branch).await {
                if commit.is_finished() {
                    return commit;
                }
            }
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for finished head of {repo}@{branch}");
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

/// A single-input pipeline running a shell command.
pub fn shell_pipeline(name: &str, input_repo: &str, glob: &str, script: &str) -> PipelineConfig {
    PipelineConfig {
        name: PipelineName::new(name).unwrap(),
        input: Input::Pfs(PfsInput {
            name: String::new(),
            repo: RepoName::new(input_repo).unwrap(),
            branch: "master".parse().unwrap(),
            glob: glob.to_string(),
            join_on: None,
            group_by: None,
            lazy: false,
            empty_files: false,
            s3: false,
        }),
        transform: Transform {
            image: "busybox".to_string(),
            cmd: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            ..Transform::default()
        },
        parallelism: 1,
        resource_requests: None,
        resource_limits: None,
        datum_timeout_secs: 0,
        datum_tries: 1,
        job_timeout_secs: 0,
        egress: None,
        deferred_processing: false,
        autoscaling: false,
        description: String::new(),
    }
}
