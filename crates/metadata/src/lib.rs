//! Transactional metadata collections for watershed.
//!
//! One SQLite database backs every collection. Each collection maps a
//! primary key to a serialized record with optional secondary indexes and
//! TTL; watch streams deliver committed changes in revision order. The task
//! queue and TTL leases are built on the same rows.

pub mod collection;
pub mod domain;
pub mod error;
pub mod lease;
pub mod store;
pub mod tasks;
pub mod watch;

pub use collection::{Order, Record};
pub use error::{MetadataError, MetadataResult};
pub use store::{MetadataStore, Transaction, TxError};
pub use tasks::{TaskQueue, TaskRecord, TaskState};
pub use watch::{EventKind, WatchEvent, WatchFilter, Watcher};
