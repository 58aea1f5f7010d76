//! Job definitions and bridge registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::scheduler::{GraphError, TaskGraph};

/// Identifier of a job whose graph a run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub i64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Error, Debug)]
pub enum JobError {
    #[error("unknown job: {0}")]
    UnknownJob(JobId),

    #[error("unknown bridge: {0}")]
    UnknownBridge(String),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Where runs obtain their graphs and bridges obtain their URLs.
#[async_trait]
pub trait JobSource: Send + Sync {
    async fn resolve_graph(&self, job_id: JobId) -> Result<Arc<TaskGraph>, JobError>;

    async fn resolve_bridge_url(&self, name: &str) -> Result<Url, JobError>;
}

#[derive(Debug)]
enum JobDefinition {
    Built(Arc<TaskGraph>),
    Dot(String),
}

/// Process-local [`JobSource`].
///
/// DOT sources are parsed on first resolve and cached; a source that fails to
/// build stays unparsed and reports its error on every resolve.
#[derive(Debug, Default)]
pub struct InMemoryJobSource {
    jobs: RwLock<HashMap<JobId, JobDefinition>>,
    bridges: RwLock<HashMap<String, Url>>,
}

impl InMemoryJobSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an already built graph.
    pub async fn register_graph(&self, job_id: JobId, graph: TaskGraph) {
        self.jobs
            .write()
            .await
            .insert(job_id, JobDefinition::Built(Arc::new(graph)));
    }

    /// Register a DOT pipeline source.
    pub async fn register_dot(&self, job_id: JobId, source: impl Into<String>) {
        self.jobs
            .write()
            .await
            .insert(job_id, JobDefinition::Dot(source.into()));
    }

    pub async fn register_bridge(&self, name: impl Into<String>, url: Url) {
        self.bridges.write().await.insert(name.into(), url);
    }

    pub async fn remove_job(&self, job_id: JobId) -> bool {
        self.jobs.write().await.remove(&job_id).is_some()
    }
}

#[async_trait]
impl JobSource for InMemoryJobSource {
    async fn resolve_graph(&self, job_id: JobId) -> Result<Arc<TaskGraph>, JobError> {
        {
            let jobs = self.jobs.read().await;
            match jobs.get(&job_id) {
                Some(JobDefinition::Built(graph)) => return Ok(graph.clone()),
                Some(JobDefinition::Dot(_)) => {}
                None => return Err(JobError::UnknownJob(job_id)),
            }
        }

        let mut jobs = self.jobs.write().await;
        let graph = match jobs.get(&job_id) {
            Some(JobDefinition::Built(graph)) => return Ok(graph.clone()),
            Some(JobDefinition::Dot(source)) => Arc::new(TaskGraph::from_dot(source)?),
            None => return Err(JobError::UnknownJob(job_id)),
        };
        debug!(job_id = job_id.0, nodes = graph.len(), "Built job graph from DOT source");
        jobs.insert(job_id, JobDefinition::Built(graph.clone()));
        Ok(graph)
    }

    async fn resolve_bridge_url(&self, name: &str) -> Result<Url, JobError> {
        self.bridges
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| JobError::UnknownBridge(name.to_string()))
    }
}
