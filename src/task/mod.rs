//! Task kinds and the uniform task contract.
//!
//! Every node in a [`TaskGraph`](crate::scheduler::TaskGraph) is described by a
//! [`TaskSpec`]. Its [`TaskKind`] is turned into a concrete [`Task`] once, when
//! the graph is built, so the scheduler never has to match on kinds at run time.

mod bridge;
mod http;
mod jsonparse;
mod median;
mod multiply;
mod numeric;
mod result;
pub(crate) mod template;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::job::JobSource;
use crate::runner::{RunId, RunInputs};
use crate::transport::HttpTransport;

pub use bridge::{BridgeConfig, BridgeTask};
pub use http::{HttpConfig, HttpTask};
pub use jsonparse::{JsonParseConfig, JsonParseTask};
pub use median::{MedianConfig, MedianTask};
pub use multiply::{MultiplyConfig, MultiplyTask};
pub use result::ResultTask;

/// Error produced by a single task execution.
///
/// Task errors are data: they are persisted alongside the TaskRun and flow
/// downstream to successors, so the type is cloneable and serializable.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskError {
    #[error("transport error: {message}")]
    Transport { message: String },

    #[error("non-success status: {status}")]
    NonSuccessStatus { status: u16 },

    #[error("unknown bridge: {name}")]
    UnknownBridge { name: String },

    #[error("path not found: {path}")]
    ParsePathNotFound { path: String },

    #[error("invalid JSON: {message}")]
    InvalidJson { message: String },

    #[error("value is not numeric: {value}")]
    NotNumeric { value: String },

    #[error("insufficient valid inputs: got {valid}, need {required}")]
    InsufficientValidInputs { valid: usize, required: usize },

    #[error("expected {expected} input(s), got {actual}")]
    WrongInputCount { expected: usize, actual: usize },

    #[error("invalid task configuration: {message}")]
    InvalidConfig { message: String },

    #[error("arithmetic overflow: {message}")]
    Overflow { message: String },

    #[error("task panicked: {message}")]
    Panicked { message: String },

    /// The task's run was cut short by a storage failure elsewhere in the run.
    #[error("task aborted: {message}")]
    Aborted { message: String },
}

impl TaskError {
    pub(crate) fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }
}

/// A `(value, error)` pair as produced by one task.
///
/// `value` is `Null` whenever `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub value: Value,
    pub error: Option<TaskError>,
}

impl TaskResult {
    /// A successful result.
    pub fn ok(value: Value) -> Self {
        Self { value, error: None }
    }

    /// A failed result.
    pub fn err(error: TaskError) -> Self {
        Self {
            value: Value::Null,
            error: Some(error),
        }
    }

    /// Returns true if this result carries no error.
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

impl From<Result<Value, TaskError>> for TaskResult {
    fn from(result: Result<Value, TaskError>) -> Self {
        match result {
            Ok(value) => Self::ok(value),
            Err(error) => Self::err(error),
        }
    }
}

/// Everything a task may reach while it runs.
#[derive(Clone)]
pub struct TaskContext {
    pub run_id: RunId,
    /// Variables supplied when the run was created.
    pub vars: Arc<RunInputs>,
    pub transport: Arc<dyn HttpTransport>,
    pub jobs: Arc<dyn JobSource>,
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("run_id", &self.run_id)
            .field("vars", &self.vars)
            .finish_non_exhaustive()
    }
}

/// A single computation unit in a pipeline.
#[async_trait]
pub trait Task: Send + Sync + fmt::Debug {
    /// Short kind name used in logs.
    fn kind(&self) -> &'static str;

    /// Whether the task still runs when a predecessor errored.
    ///
    /// Tasks returning `false` are never invoked with an errored input; the
    /// scheduler writes the first upstream error in their place.
    fn tolerates_upstream_errors(&self) -> bool {
        false
    }

    /// Run input variables referenced by this task's templates.
    fn referenced_vars(&self) -> Vec<String> {
        Vec::new()
    }

    /// Execute the task with its predecessors' results in declared order.
    async fn run(&self, ctx: &TaskContext, inputs: &[TaskResult]) -> Result<Value, TaskError>;
}

/// Kind-specific configuration of a task node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TaskKind {
    Http(HttpConfig),
    Bridge(BridgeConfig),
    JsonParse(JsonParseConfig),
    Multiply(MultiplyConfig),
    Median(MedianConfig),
    Result,
}

impl TaskKind {
    /// The kind name as written in pipeline sources.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Http(_) => "http",
            Self::Bridge(_) => "bridge",
            Self::JsonParse(_) => "jsonparse",
            Self::Multiply(_) => "multiply",
            Self::Median(_) => "median",
            Self::Result => "result",
        }
    }

    /// Returns true for the result sink kind.
    pub fn is_result(&self) -> bool {
        matches!(self, Self::Result)
    }

    /// Build the executable task for this configuration.
    ///
    /// Returns a human-readable reason when the configuration is invalid.
    pub fn build(&self) -> Result<Arc<dyn Task>, String> {
        let task: Arc<dyn Task> = match self {
            Self::Http(cfg) => Arc::new(HttpTask::new(cfg)?),
            Self::Bridge(cfg) => Arc::new(BridgeTask::new(cfg)?),
            Self::JsonParse(cfg) => Arc::new(JsonParseTask::new(cfg)),
            Self::Multiply(cfg) => Arc::new(MultiplyTask::new(cfg)),
            Self::Median(cfg) => Arc::new(MedianTask::new(cfg)?),
            Self::Result => Arc::new(ResultTask),
        };
        Ok(task)
    }
}

/// Static description of one node in a task graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Identifier of the node, unique within its graph.
    pub dot_id: String,
    #[serde(flatten)]
    pub kind: TaskKind,
    /// Predecessor DotIDs. Input order follows this list.
    #[serde(default)]
    pub predecessors: Vec<String>,
}

impl TaskSpec {
    pub fn new(dot_id: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            dot_id: dot_id.into(),
            kind,
            predecessors: Vec::new(),
        }
    }

    /// Append a predecessor.
    pub fn after(mut self, predecessor: impl Into<String>) -> Self {
        self.predecessors.push(predecessor.into());
        self
    }
}

/// Require exactly `expected` inputs.
pub(crate) fn expect_inputs(inputs: &[TaskResult], expected: usize) -> Result<(), TaskError> {
    if inputs.len() != expected {
        return Err(TaskError::WrongInputCount {
            expected,
            actual: inputs.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use async_trait::async_trait;
    use reqwest::Url;

    use super::TaskContext;
    use crate::job::{JobError, JobSource};
    use crate::runner::{RunId, RunInputs};
    use crate::scheduler::TaskGraph;
    use crate::transport::{HttpRequest, HttpResponse, HttpTransport, TransportError};
    use crate::JobId;

    #[derive(Debug)]
    struct NoTransport;

    #[async_trait]
    impl HttpTransport for NoTransport {
        async fn send(&self, _request: HttpRequest) -> Result<HttpResponse, TransportError> {
            Err(TransportError("no transport in unit tests".to_string()))
        }
    }

    #[derive(Debug)]
    struct NoJobs;

    #[async_trait]
    impl JobSource for NoJobs {
        async fn resolve_graph(&self, job_id: JobId) -> Result<Arc<TaskGraph>, JobError> {
            Err(JobError::UnknownJob(job_id))
        }

        async fn resolve_bridge_url(&self, name: &str) -> Result<Url, JobError> {
            Err(JobError::UnknownBridge(name.to_string()))
        }
    }

    /// A context whose collaborators refuse every call.
    pub(crate) fn context() -> TaskContext {
        TaskContext {
            run_id: RunId(1),
            vars: Arc::new(RunInputs::default()),
            transport: Arc::new(NoTransport),
            jobs: Arc::new(NoJobs),
        }
    }
}
