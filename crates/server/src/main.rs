//! Watershed server binary.

use anyhow::{Context, Result};
use clap::Parser;
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use watershed_core::config::AppConfig;
use watershed_graph::CommitGraph;
use watershed_metadata::MetadataStore;
use watershed_pipeline::{LocalRunner, Orchestrator};
use watershed_server::{create_router, AppState};
use watershed_storage::{FilesetStore, FilesystemBackend};

/// Watershed - a data-versioning and pipeline-orchestration server
#[derive(Parser, Debug)]
#[command(name = "watershedd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "WATERSHED_CONFIG",
        default_value = "config/server.toml"
    )]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "watershed=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut figment = Figment::new();
    if std::path::Path::new(&args.config).exists() {
        figment = figment.merge(Toml::file(&args.config));
    } else {
        tracing::info!(
            config = %args.config,
            "Config file not found; using defaults and environment"
        );
    }
    figment = figment.merge(Env::prefixed("WATERSHED_").split("__"));
    let config: AppConfig = figment
        .extract()
        .context("failed to load configuration")?;

    let store = Arc::new(
        MetadataStore::open(&config.database.path, config.database.busy_timeout_ms)
            .await
            .context("failed to open metadata store")?,
    );
    tracing::info!(path = %config.database.path.display(), "Metadata store ready");

    let chunks = FilesystemBackend::new(&config.storage.root)
        .await
        .context("failed to open chunk storage")?;
    let filesets = FilesetStore::new(Arc::new(chunks));
    tracing::info!(root = %config.storage.root.display(), "Chunk storage ready");

    let graph = Arc::new(
        CommitGraph::new(store.clone(), filesets)
            .await
            .context("failed to initialize commit graph")?,
    );

    let work_root = config
        .storage
        .root
        .parent()
        .map(|parent| parent.join("work"))
        .unwrap_or_else(|| std::path::PathBuf::from("data/work"));
    let orchestrator = Orchestrator::new(
        graph.clone(),
        store.clone(),
        config.orchestration.clone(),
        Arc::new(LocalRunner::new()),
        work_root,
    );
    orchestrator
        .start()
        .await
        .context("failed to start orchestrator")?;
    tracing::info!(
        workers = config.orchestration.worker_count,
        "Orchestrator running"
    );

    let bind: SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {:?}", config.server.bind))?;
    let state = AppState::new(config, store, graph, orchestrator.clone());
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    tracing::info!(addr = %listener.local_addr()?, "Watershed server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("Shutting down orchestrator");
    orchestrator.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
