//! Application state shared across handlers.

use std::sync::Arc;
use watershed_core::config::AppConfig;
use watershed_graph::CommitGraph;
use watershed_metadata::MetadataStore;
use watershed_pipeline::Orchestrator;

/// Shared handles behind every request.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Arc<MetadataStore>,
    pub graph: Arc<CommitGraph>,
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        store: Arc<MetadataStore>,
        graph: Arc<CommitGraph>,
        orchestrator: Arc<Orchestrator>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            store,
            graph,
            orchestrator,
        }
    }
}
