//! Durable task queue with lease semantics.
//!
//! Tasks are plain collection records grouped by an opaque group key (one
//! group per job). A claimed task is invisible to other workers until its
//! lease lapses; workers renew the lease while processing. Lease expiry
//! makes the task claimable again, so execution is at-least-once.

use crate::collection::Record;
use crate::error::{MetadataError, MetadataResult};
use crate::store::{unix_now, MetadataStore};
use crate::watch::{WatchFilter, Watcher};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use watershed_core::TaskId;

/// Task lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Claimed,
    Done,
    Failed,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// A queued unit of work.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub group: String,
    pub payload: serde_json::Value,
    pub state: TaskState,
    /// Claims so far, including the current one.
    pub attempts: u32,
    pub worker: Option<String>,
    /// Unix seconds; a claimed task past this instant is claimable again.
    pub lease_until: Option<i64>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl TaskRecord {
    fn lease_lapsed(&self, now: i64) -> bool {
        self.state == TaskState::Claimed && self.lease_until.is_some_and(|until| until <= now)
    }
}

impl Record for TaskRecord {
    const COLLECTION: &'static str = "tasks";

    fn key(&self) -> String {
        format!("{}/{}", self.group, self.id)
    }

    fn indexes(&self) -> Vec<(&'static str, String)> {
        vec![
            ("group", self.group.clone()),
            ("group_state", format!("{}/{}", self.group, self.state.as_str())),
        ]
    }
}

/// Handle to the shared task queue.
#[derive(Clone)]
pub struct TaskQueue {
    store: Arc<MetadataStore>,
}

impl TaskQueue {
    pub fn new(store: Arc<MetadataStore>) -> Self {
        Self { store }
    }

    /// Enqueue a task at the tail of `group`.
    pub async fn enqueue(
        &self,
        group: &str,
        payload: serde_json::Value,
    ) -> MetadataResult<TaskId> {
        let task = TaskRecord {
            id: TaskId::new(),
            group: group.to_string(),
            payload,
            state: TaskState::Pending,
            attempts: 0,
            worker: None,
            lease_until: None,
            result: None,
            error: None,
        };
        let id = task.id;
        self.store
            .transact(|tx| {
                let task = task.clone();
                Box::pin(async move { tx.insert(&task).await })
            })
            .await?;
        Ok(id)
    }

    /// Claim the oldest eligible task of `group`: pending tasks first, then
    /// claimed tasks whose lease lapsed. Returns `None` when nothing is
    /// eligible.
    pub async fn claim(
        &self,
        group: &str,
        worker: &str,
        lease: Duration,
    ) -> MetadataResult<Option<TaskRecord>> {
        let group_owned = group.to_string();
        let worker_owned = worker.to_string();
        self.store
            .transact(move |tx| {
                let group = group_owned.clone();
                let worker = worker_owned.clone();
                Box::pin(async move {
                    let now = unix_now();
                    let pending: Vec<TaskRecord> = tx
                        .get_by_index("group_state", &format!("{group}/pending"))
                        .await?;
                    let claimed: Vec<TaskRecord> = tx
                        .get_by_index("group_state", &format!("{group}/claimed"))
                        .await?;
                    let candidate = pending
                        .into_iter()
                        .next()
                        .or_else(|| claimed.into_iter().find(|t| t.lease_lapsed(now)));
                    let Some(mut task) = candidate else {
                        return Ok(None);
                    };
                    task.state = TaskState::Claimed;
                    task.worker = Some(worker);
                    task.attempts += 1;
                    task.lease_until = Some(now + lease.as_secs() as i64);
                    tx.put(&task).await?;
                    Ok(Some(task))
                })
            })
            .await
    }

    /// Extend the caller's lease. Fails if the task moved on (lease lost to
    /// another worker, or already terminal).
    pub async fn renew(
        &self,
        task: &TaskRecord,
        lease: Duration,
    ) -> MetadataResult<()> {
        let key = task.key();
        let worker = task.worker.clone();
        self.store
            .transact(move |tx| {
                let key = key.clone();
                let worker = worker.clone();
                Box::pin(async move {
                    let mut current: TaskRecord = tx.get(&key).await?;
                    if current.state != TaskState::Claimed || current.worker != worker {
                        return Err(MetadataError::Internal(format!(
                            "lease on task {key} lost"
                        )));
                    }
                    current.lease_until = Some(unix_now() + lease.as_secs() as i64);
                    tx.put(&current).await
                })
            })
            .await
    }

    /// Mark a claimed task done, attaching its result.
    pub async fn complete(
        &self,
        task: &TaskRecord,
        result: serde_json::Value,
    ) -> MetadataResult<()> {
        self.finish(task, TaskState::Done, Some(result), None).await
    }

    /// Mark a claimed task failed.
    pub async fn fail(&self, task: &TaskRecord, error: String) -> MetadataResult<()> {
        self.finish(task, TaskState::Failed, None, Some(error)).await
    }

    async fn finish(
        &self,
        task: &TaskRecord,
        state: TaskState,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> MetadataResult<()> {
        let key = task.key();
        let worker = task.worker.clone();
        self.store
            .transact(move |tx| {
                let key = key.clone();
                let worker = worker.clone();
                let result = result.clone();
                let error = error.clone();
                Box::pin(async move {
                    let mut current: TaskRecord = tx.get(&key).await?;
                    if current.state != TaskState::Claimed || current.worker != worker {
                        return Err(MetadataError::Internal(format!(
                            "lease on task {key} lost"
                        )));
                    }
                    current.state = state;
                    current.result = result;
                    current.error = error;
                    current.lease_until = None;
                    tx.put(&current).await
                })
            })
            .await
    }

    /// Put a claimed task back up for grabs, voiding its current lease.
    pub async fn release(&self, task: &TaskRecord) -> MetadataResult<()> {
        let key = task.key();
        self.store
            .transact(move |tx| {
                let key = key.clone();
                Box::pin(async move {
                    let mut current: TaskRecord = tx.get(&key).await?;
                    if current.state != TaskState::Claimed {
                        return Ok(());
                    }
                    current.state = TaskState::Pending;
                    current.worker = None;
                    current.lease_until = None;
                    tx.put(&current).await
                })
            })
            .await
    }

    /// Watch every task change of `group`.
    pub fn watch(&self, group: &str) -> Watcher<TaskRecord> {
        self.store
            .watch(WatchFilter::Index("group", group.to_string()))
    }

    /// Tasks of `group` in a given state, in enqueue order.
    pub async fn list_state(
        &self,
        group: &str,
        state: TaskState,
    ) -> MetadataResult<Vec<TaskRecord>> {
        self.store
            .get_by_index("group_state", &format!("{group}/{}", state.as_str()))
            .await
    }

    /// Remove every task of `group`. Used when a job reaches a terminal
    /// state or its commit-set is squashed.
    pub async fn purge_group(&self, group: &str) -> MetadataResult<u64> {
        let prefix = format!("{group}/");
        self.store
            .transact(move |tx| {
                let prefix = prefix.clone();
                Box::pin(async move { tx.delete_prefix::<TaskRecord>(&prefix).await })
            })
            .await
    }
}
