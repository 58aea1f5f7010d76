//! Execution store trait and types.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::job::JobId;
use crate::task::{TaskError, TaskResult, TaskSpec};

/// Unique identifier for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(pub i64);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running,
    Completed,
    Errored,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Errored)
    }

    /// Whether a run may move from `self` to `next`.
    ///
    /// `Running -> Running` is allowed so a resumed run can be re-marked.
    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Errored)
                | (Running, Running)
                | (Running, Completed)
                | (Running, Errored)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Errored => "errored",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "errored" => Some(Self::Errored),
            _ => None,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Variables supplied from outside the graph when a run is created.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunInputs(BTreeMap<String, Value>);

impl RunInputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(name.into(), value)
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.insert(name, value);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for RunInputs {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// A run as persisted.
///
/// `graph` is the job's graph as it was when the run was created. Resuming a
/// run and reading its results use it, never the job's current definition.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub id: RunId,
    pub job_id: JobId,
    pub inputs: RunInputs,
    pub graph: Vec<TaskSpec>,
    pub state: RunState,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// One node's execution within a run.
///
/// The row appears when the node is claimed and is finished exactly once,
/// by the claim holder.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRun {
    pub run_id: RunId,
    pub dot_id: String,
    pub value: Value,
    pub error: Option<TaskError>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskRun {
    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    /// The written `(value, error)` pair, or `None` while unwritten.
    pub fn result(&self) -> Option<TaskResult> {
        self.is_finished().then(|| TaskResult {
            value: self.value.clone(),
            error: self.error.clone(),
        })
    }
}

/// Error type for store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage error: {0}")]
    StorageError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("deserialization error: {0}")]
    DeserializationError(String),

    #[error("run not found: {0}")]
    RunNotFound(RunId),

    #[error("run {run_id} cannot move from {from} to {to}")]
    InvalidTransition {
        run_id: RunId,
        from: RunState,
        to: RunState,
    },

    #[error("task '{dot_id}' of run {run_id} was never claimed")]
    NotClaimed { run_id: RunId, dot_id: String },

    #[error("task '{dot_id}' of run {run_id} is already written")]
    AlreadyWritten { run_id: RunId, dot_id: String },
}

/// Durable record of runs and their task runs.
///
/// Implementations must make [`claim_node`](Self::claim_node) atomic: for a
/// given `(run, node)` exactly one caller ever observes `true`, even across
/// processes sharing the store.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Create a run in `Pending`, pinned to `graph`.
    async fn create_run(
        &self,
        job_id: JobId,
        inputs: &RunInputs,
        graph: &[TaskSpec],
    ) -> Result<RunId, StoreError>;

    /// Fetch a run, or `None` if it does not exist.
    async fn run(&self, run_id: RunId) -> Result<Option<RunRecord>, StoreError>;

    async fn run_state(&self, run_id: RunId) -> Result<RunState, StoreError> {
        self.run(run_id)
            .await?
            .map(|r| r.state)
            .ok_or(StoreError::RunNotFound(run_id))
    }

    /// Move a run to `Running`.
    async fn mark_running(&self, run_id: RunId) -> Result<(), StoreError>;

    /// Move a run to `Completed` or `Errored` and stamp its finish time.
    async fn mark_terminal(&self, run_id: RunId, state: RunState) -> Result<(), StoreError>;

    /// Try to claim a node. Returns `true` only for the winner.
    async fn claim_node(&self, run_id: RunId, dot_id: &str) -> Result<bool, StoreError>;

    /// Write the claimed node's result. Fails if unclaimed or already written.
    async fn write_task_run(
        &self,
        run_id: RunId,
        dot_id: &str,
        result: &TaskResult,
    ) -> Result<(), StoreError>;

    async fn read_task_run(&self, run_id: RunId, dot_id: &str)
        -> Result<Option<TaskRun>, StoreError>;

    /// All task runs of a run, claimed or written, in claim order.
    async fn task_runs(&self, run_id: RunId) -> Result<Vec<TaskRun>, StoreError>;

    /// Runs not yet in a terminal state, oldest first.
    async fn unfinished_runs(&self) -> Result<Vec<RunRecord>, StoreError>;

    /// Drop claims that were never written for non-terminal runs.
    /// Call on startup to recover from crashes.
    /// Returns the number of claims released.
    async fn recover_orphans(&self) -> Result<usize, StoreError> {
        Ok(0)
    }
}

#[async_trait]
impl<T: ExecutionStore + ?Sized> ExecutionStore for std::sync::Arc<T> {
    async fn create_run(
        &self,
        job_id: JobId,
        inputs: &RunInputs,
        graph: &[TaskSpec],
    ) -> Result<RunId, StoreError> {
        (**self).create_run(job_id, inputs, graph).await
    }

    async fn run(&self, run_id: RunId) -> Result<Option<RunRecord>, StoreError> {
        (**self).run(run_id).await
    }

    async fn run_state(&self, run_id: RunId) -> Result<RunState, StoreError> {
        (**self).run_state(run_id).await
    }

    async fn mark_running(&self, run_id: RunId) -> Result<(), StoreError> {
        (**self).mark_running(run_id).await
    }

    async fn mark_terminal(&self, run_id: RunId, state: RunState) -> Result<(), StoreError> {
        (**self).mark_terminal(run_id, state).await
    }

    async fn claim_node(&self, run_id: RunId, dot_id: &str) -> Result<bool, StoreError> {
        (**self).claim_node(run_id, dot_id).await
    }

    async fn write_task_run(
        &self,
        run_id: RunId,
        dot_id: &str,
        result: &TaskResult,
    ) -> Result<(), StoreError> {
        (**self).write_task_run(run_id, dot_id, result).await
    }

    async fn read_task_run(
        &self,
        run_id: RunId,
        dot_id: &str,
    ) -> Result<Option<TaskRun>, StoreError> {
        (**self).read_task_run(run_id, dot_id).await
    }

    async fn task_runs(&self, run_id: RunId) -> Result<Vec<TaskRun>, StoreError> {
        (**self).task_runs(run_id).await
    }

    async fn unfinished_runs(&self) -> Result<Vec<RunRecord>, StoreError> {
        (**self).unfinished_runs().await
    }

    async fn recover_orphans(&self) -> Result<usize, StoreError> {
        (**self).recover_orphans().await
    }
}
