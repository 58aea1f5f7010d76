//! # Oracleflow
//!
//! Dependency-driven task DAG runner for oracle data pipelines.
//!
//! A job is a DAG of typed tasks (HTTP fetches, bridge calls, JSON parsing,
//! arithmetic and fault-tolerant medians) that ends in a single result node.
//! The [`Runner`] executes runs of such jobs concurrently, persists every
//! task's output exactly once through an [`ExecutionStore`], and lets any
//! number of callers wait for a run's answer.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use oracleflow::{
//!     InMemoryJobSource, JobId, MemoryExecutionStore, RunInputs, RunnerBuilder, WaitContext,
//! };
//!
//! let jobs = Arc::new(InMemoryJobSource::new());
//! jobs.register_dot(JobId(1), r#"
//!     price [type=http url="https://example.com/price"];
//!     parse [type=jsonparse path="data,price"];
//!     cents [type=multiply times=100];
//!     price -> parse -> cents;
//! "#).await;
//!
//! let runner = RunnerBuilder::new(MemoryExecutionStore::new())
//!     .job_source(jobs)
//!     .max_concurrent(8)
//!     .build()?;
//! runner.start().await?;
//!
//! let run_id = runner.create_run(JobId(1), RunInputs::new()).await?;
//! let results = runner
//!     .await_results(run_id, &WaitContext::with_timeout(Duration::from_secs(10)))
//!     .await?;
//! ```
//!
//! ## Feature Flags
//!
//! - `sqlite` - Enable the SQLite-backed execution store (default)

pub mod job;
pub mod runner;
pub mod scheduler;
pub mod task;
pub mod transport;

pub use job::{InMemoryJobSource, JobError, JobId, JobSource};
pub use runner::{
    ExecutionStore, MemoryExecutionStore, RunId, RunInputs, RunRecord, RunState, Runner,
    RunnerBuilder, RunnerConfig, RunnerError, StoreError, TaskRun, WaitContext,
};
pub use scheduler::{GraphError, TaskGraph, TaskNode, IMPLICIT_RESULT_ID};
pub use task::{
    BridgeConfig, HttpConfig, JsonParseConfig, MedianConfig, MultiplyConfig, Task,
    TaskContext, TaskError, TaskKind, TaskResult, TaskSpec,
};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport, TransportError};

#[cfg(feature = "sqlite")]
pub use runner::SqliteExecutionStore;

pub use tokio_util::sync::CancellationToken;
