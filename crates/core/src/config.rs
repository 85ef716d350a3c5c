//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:1650").
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Enable request tracing.
    #[serde(default)]
    pub enable_tracing: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            enable_tracing: false,
        }
    }
}

/// Metadata database configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database path.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
    /// Busy timeout for concurrent writers, in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

/// Chunk storage configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory for the filesystem chunk backend.
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
        }
    }
}

/// Orchestration tunables applied to every pipeline.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrchestrationConfig {
    /// Worker processes pulling from the shared task queue.
    #[serde(default = "default_worker_count")]
    pub worker_count: u32,
    /// Datums per dispatched batch = parallelism * batch_factor.
    #[serde(default = "default_batch_factor")]
    pub batch_factor: u32,
    /// Task lease duration in seconds; a claimed task becomes claimable
    /// again when its lease lapses.
    #[serde(default = "default_task_lease_secs")]
    pub task_lease_secs: u64,
    /// Controller mastership lease in seconds.
    #[serde(default = "default_master_lease_secs")]
    pub master_lease_secs: u64,
    /// Base backoff for controller retry loops, in milliseconds.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Backoff ceiling in milliseconds.
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            batch_factor: default_batch_factor(),
            task_lease_secs: default_task_lease_secs(),
            master_lease_secs: default_master_lease_secs(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

/// Top-level application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub orchestration: OrchestrationConfig,
}

impl AppConfig {
    /// Config rooted under a scratch directory, for tests.
    pub fn for_testing(root: &std::path::Path) -> Self {
        Self {
            server: ServerConfig {
                bind: "127.0.0.1:0".to_string(),
                enable_tracing: false,
            },
            database: DatabaseConfig {
                path: root.join("metadata.db"),
                busy_timeout_ms: 5000,
            },
            storage: StorageConfig {
                root: root.join("chunks"),
            },
            orchestration: OrchestrationConfig {
                worker_count: 2,
                task_lease_secs: 5,
                ..OrchestrationConfig::default()
            },
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:1650".to_string()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/metadata.db")
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("data/chunks")
}

fn default_worker_count() -> u32 {
    4
}

fn default_batch_factor() -> u32 {
    4
}

fn default_task_lease_secs() -> u64 {
    30
}

fn default_master_lease_secs() -> u64 {
    15
}

fn default_backoff_base_ms() -> u64 {
    250
}

fn default_backoff_max_ms() -> u64 {
    30_000
}
