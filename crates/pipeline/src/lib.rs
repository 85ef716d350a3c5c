//! Pipeline orchestration for watershed: datum planning, the job state
//! machine, per-pipeline controllers, and the worker runtime.

pub mod controller;
pub mod error;
pub mod jobs;
pub mod orchestrator;
pub mod pipelines;
pub mod planner;
pub mod runtime;
pub mod worker;

pub use controller::{ControllerContext, PipelineController};
pub use error::{PipelineError, PipelineResult};
pub use jobs::{JobOutcome, JobTotals};
pub use orchestrator::Orchestrator;
pub use planner::{diff_datums, plan_datums, DatumDiff};
pub use runtime::{ContainerRuntime, LocalRunner, MountSpec, RunResult, RunSpec};
pub use worker::{task_group, BatchResult, DatumBatch, Worker};
