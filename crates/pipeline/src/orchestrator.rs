//! The orchestrator: lifecycle of controllers and workers in one process.
//!
//! Controllers and workers are backgrounded tokio tasks tracked in a
//! registry; a watchdog respawns controllers whose tasks die and reaps
//! finished handles. Mastership still goes through the store's TTL leases,
//! so running several orchestrators against one store is safe.

use crate::controller::{ControllerContext, PipelineController};
use crate::error::PipelineResult;
use crate::runtime::ContainerRuntime;
use crate::worker::Worker;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use watershed_core::config::OrchestrationConfig;
use watershed_core::ids::PipelineName;
use watershed_core::PipelineInfo;
use watershed_metadata::{EventKind, MetadataStore, TaskQueue, WatchFilter};
use watershed_graph::CommitGraph;

/// How often the watchdog scans for dead controller tasks.
const WATCHDOG_PERIOD: Duration = Duration::from_secs(10);

pub struct Orchestrator {
    ctx: ControllerContext,
    runtime: Arc<dyn ContainerRuntime>,
    work_root: PathBuf,
    shutdown_tx: watch::Sender<bool>,
    controllers: Mutex<HashMap<String, JoinHandle<()>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(
        graph: Arc<CommitGraph>,
        store: Arc<MetadataStore>,
        config: OrchestrationConfig,
        runtime: Arc<dyn ContainerRuntime>,
        work_root: PathBuf,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            ctx: ControllerContext {
                graph,
                queue: TaskQueue::new(store.clone()),
                store,
                config,
                egress_root: work_root.join("egress"),
            },
            runtime,
            work_root,
            shutdown_tx,
            controllers: Mutex::new(HashMap::new()),
            background: Mutex::new(Vec::new()),
        })
    }

    pub fn graph(&self) -> &Arc<CommitGraph> {
        &self.ctx.graph
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.ctx.queue
    }

    /// Spawn the worker fleet, controllers for every registered pipeline,
    /// and the watch/watchdog tasks.
    pub async fn start(self: &Arc<Self>) -> PipelineResult<()> {
        let shutdown = self.shutdown_tx.subscribe();
        {
            let mut background = self.background.lock().await;
            for i in 0..self.ctx.config.worker_count {
                let worker = Worker::new(
                    format!("worker-{i}"),
                    self.ctx.store.clone(),
                    self.ctx.graph.filesets().clone(),
                    self.runtime.clone(),
                    self.work_root.join("scratch"),
                    Duration::from_secs(self.ctx.config.task_lease_secs),
                );
                background.push(worker.spawn(shutdown.clone()));
            }
            background.push(self.clone().spawn_pipeline_watch());
            background.push(self.clone().spawn_watchdog());
        }

        let pipelines: Vec<PipelineInfo> = self
            .ctx
            .store
            .list(watershed_metadata::Order::Asc)
            .await?;
        for pipeline in pipelines {
            self.ensure_controller(pipeline.name().clone()).await;
        }
        Ok(())
    }

    /// Spawn a controller for `name` unless a live one is registered.
    pub async fn ensure_controller(&self, name: PipelineName) {
        let mut controllers = self.controllers.lock().await;
        if let Some(handle) = controllers.get(name.as_str()) {
            if !handle.is_finished() {
                return;
            }
        }
        tracing::info!(pipeline = %name, "Spawning pipeline controller");
        let handle = PipelineController::spawn(
            name.clone(),
            self.ctx.clone(),
            self.shutdown_tx.subscribe(),
        );
        controllers.insert(name.to_string(), handle);
    }

    /// Stop and forget the controller of a deleted pipeline.
    pub async fn drop_controller(&self, name: &PipelineName) {
        if let Some(handle) = self.controllers.lock().await.remove(name.as_str()) {
            handle.abort();
            tracing::info!(pipeline = %name, "Dropped pipeline controller");
        }
    }

    /// React to pipeline table changes: new rows get controllers, deleted
    /// rows lose them.
    fn spawn_pipeline_watch(self: Arc<Self>) -> JoinHandle<()> {
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut watcher = self
                .ctx
                .store
                .watch::<PipelineInfo>(WatchFilter::All);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    event = watcher.next() => match event {
                        Ok(event) => {
                            let name = event.record.name().clone();
                            match event.kind {
                                EventKind::Put => self.ensure_controller(name).await,
                                EventKind::Delete => self.drop_controller(&name).await,
                            }
                        }
                        Err(watershed_metadata::MetadataError::WatchLagged) => {
                            watcher = self.ctx.store.watch(WatchFilter::All);
                            // re-sync: spawn any controller we missed
                            if let Ok(pipelines) = self
                                .ctx
                                .store
                                .list::<PipelineInfo>(watershed_metadata::Order::Asc)
                                .await
                            {
                                for pipeline in pipelines {
                                    self.ensure_controller(pipeline.name().clone()).await;
                                }
                            }
                        }
                        Err(_) => break,
                    }
                }
            }
        })
    }

    /// Respawn controllers whose tasks died (panic or abort) while their
    /// pipeline still exists.
    fn spawn_watchdog(self: Arc<Self>) -> JoinHandle<()> {
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(WATCHDOG_PERIOD) => {}
                }
                let dead: Vec<String> = {
                    let mut controllers = self.controllers.lock().await;
                    let dead: Vec<String> = controllers
                        .iter()
                        .filter(|(_, handle)| handle.is_finished())
                        .map(|(name, _)| name.clone())
                        .collect();
                    for name in &dead {
                        controllers.remove(name);
                    }
                    dead
                };
                for name in dead {
                    let Ok(parsed) = name.parse::<PipelineName>() else {
                        continue;
                    };
                    let exists = self
                        .ctx
                        .store
                        .try_get::<PipelineInfo>(&name)
                        .await
                        .ok()
                        .flatten()
                        .is_some();
                    if exists {
                        tracing::warn!(pipeline = %name, "Controller died; respawning");
                        self.ensure_controller(parsed).await;
                    }
                }
            }
        })
    }

    /// Stop everything: controllers, workers, watches.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        for (_, handle) in self.controllers.lock().await.drain() {
            let _ = handle.await;
        }
        for handle in self.background.lock().await.drain(..) {
            let _ = handle.await;
        }
    }
}
