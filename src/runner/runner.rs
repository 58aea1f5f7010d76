//! Runner that owns the worker budget and every in-flight run.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{watch, Mutex, Semaphore};
use tracing::{debug, info, warn};

use super::config::RunnerConfig;
use super::store::{ExecutionStore, RunId, RunInputs, RunState, StoreError};
use super::wait::{WaitContext, WaitInterrupted};
use crate::job::{InMemoryJobSource, JobError, JobId, JobSource};
use crate::scheduler::{GraphError, RunScheduler, TaskGraph};
use crate::task::{TaskContext, TaskResult};
use crate::transport::{HttpTransport, ReqwestTransport, TransportError};

/// Error type for runner operations.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("unknown job: {0}")]
    UnknownJob(JobId),

    #[error("unknown bridge: {0}")]
    UnknownBridge(String),

    #[error("invalid inputs: {0}")]
    InvalidInputs(String),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("run not found: {0}")]
    RunNotFound(RunId),

    #[error("run {0} has not finished")]
    RunNotTerminal(RunId),

    #[error("run {0} errored before producing its results")]
    RunErrored(RunId),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("cancelled")]
    Cancelled,

    #[error("runner has not been started")]
    NotStarted,

    #[error("runner was already started")]
    AlreadyStarted,

    #[error("runner is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for RunnerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::RunNotFound(id) => Self::RunNotFound(id),
            other => Self::Store(other),
        }
    }
}

impl From<JobError> for RunnerError {
    fn from(e: JobError) -> Self {
        match e {
            JobError::UnknownJob(id) => Self::UnknownJob(id),
            JobError::UnknownBridge(name) => Self::UnknownBridge(name),
            JobError::Graph(g) => Self::Graph(g),
        }
    }
}

impl From<WaitInterrupted> for RunnerError {
    fn from(e: WaitInterrupted) -> Self {
        match e {
            WaitInterrupted::DeadlineExceeded => Self::DeadlineExceeded,
            WaitInterrupted::Cancelled => Self::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Started,
    Stopping,
    Stopped,
}

struct InFlight {
    done: watch::Receiver<Option<RunState>>,
}

struct RunnerState {
    lifecycle: Lifecycle,
    in_flight: HashMap<RunId, InFlight>,
}

/// Executes runs of registered jobs.
///
/// Runs are created with [`create_run`](Self::create_run) and proceed in the
/// background. Any number of callers may [`await_run`](Self::await_run) the
/// same run; each wait is governed only by its own [`WaitContext`].
pub struct Runner<S: ExecutionStore> {
    store: Arc<S>,
    jobs: Arc<dyn JobSource>,
    transport: Arc<dyn HttpTransport>,
    config: RunnerConfig,
    permits: Arc<Semaphore>,
    state: Arc<Mutex<RunnerState>>,
}

impl<S: ExecutionStore> Clone for Runner<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            jobs: self.jobs.clone(),
            transport: self.transport.clone(),
            config: self.config.clone(),
            permits: self.permits.clone(),
            state: self.state.clone(),
        }
    }
}

impl<S: ExecutionStore + 'static> Runner<S> {
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Start accepting runs.
    ///
    /// Releases claims orphaned by a previous process and resumes every run
    /// the store still holds as unfinished, from the graph stored with it. A
    /// run whose stored graph no longer builds is marked `Errored`. May be
    /// called once.
    pub async fn start(&self) -> Result<(), RunnerError> {
        let mut state = self.state.lock().await;
        if state.lifecycle != Lifecycle::Idle {
            return Err(RunnerError::AlreadyStarted);
        }

        let released = self.store.recover_orphans().await?;
        if released > 0 {
            info!(released, "Released orphaned task claims");
        }

        for run in self.store.unfinished_runs().await? {
            match TaskGraph::build(run.graph) {
                Ok(graph) => {
                    info!(run_id = run.id.0, job_id = run.job_id.0, "Resuming run");
                    self.spawn_run(&mut state, run.id, Arc::new(graph), run.inputs);
                }
                Err(e) => {
                    warn!(
                        run_id = run.id.0,
                        job_id = run.job_id.0,
                        error = %e,
                        "Cannot resume run; marking errored"
                    );
                    self.store.mark_terminal(run.id, RunState::Errored).await?;
                }
            }
        }

        state.lifecycle = Lifecycle::Started;
        info!(
            max_concurrent = self.config.max_concurrent,
            resumed = state.in_flight.len(),
            "Runner started"
        );
        Ok(())
    }

    /// Stop accepting runs and wait for every in-flight run to finish.
    ///
    /// Concurrent callers all wait for the same drain.
    pub async fn stop(&self) -> Result<(), RunnerError> {
        let receivers: Vec<_> = {
            let mut state = self.state.lock().await;
            match state.lifecycle {
                Lifecycle::Idle => return Err(RunnerError::NotStarted),
                Lifecycle::Stopped => return Ok(()),
                Lifecycle::Started | Lifecycle::Stopping => {}
            }
            state.lifecycle = Lifecycle::Stopping;
            state.in_flight.values().map(|f| f.done.clone()).collect()
        };

        info!(in_flight = receivers.len(), "Draining runs");
        for mut done in receivers {
            // A closed channel means the run's worker is gone either way.
            let _ = done.wait_for(Option::is_some).await;
        }

        self.state.lock().await.lifecycle = Lifecycle::Stopped;
        info!("Runner stopped");
        Ok(())
    }

    /// Create a run of `job_id` and start executing it in the background.
    pub async fn create_run(
        &self,
        job_id: JobId,
        inputs: RunInputs,
    ) -> Result<RunId, RunnerError> {
        self.ensure_accepting().await?;

        let graph = self.jobs.resolve_graph(job_id).await?;
        let missing: Vec<String> = graph
            .required_vars()
            .into_iter()
            .filter(|name| !inputs.contains(name))
            .collect();
        if !missing.is_empty() {
            return Err(RunnerError::InvalidInputs(format!(
                "missing run inputs: {}",
                missing.join(", ")
            )));
        }

        let run_id = self
            .store
            .create_run(job_id, &inputs, &graph.specs())
            .await?;

        let mut state = self.state.lock().await;
        if state.lifecycle != Lifecycle::Started {
            drop(state);
            self.store.mark_terminal(run_id, RunState::Errored).await?;
            return Err(RunnerError::ShuttingDown);
        }
        self.spawn_run(&mut state, run_id, graph, inputs);
        info!(run_id = run_id.0, job_id = job_id.0, "Created run");
        Ok(run_id)
    }

    /// Wait until `run_id` is terminal and return its final state.
    ///
    /// Runs executing in this process are awaited through their completion
    /// signal; any other run is polled from the store.
    pub async fn await_run(&self, run_id: RunId, ctx: &WaitContext) -> Result<RunState, RunnerError> {
        let done = self
            .state
            .lock()
            .await
            .in_flight
            .get(&run_id)
            .map(|f| f.done.clone());

        let wait = async {
            if let Some(mut done) = done {
                if let Ok(state) = done.wait_for(Option::is_some).await {
                    if let Some(state) = *state {
                        return Ok(state);
                    }
                }
            }
            self.poll_until_terminal(run_id).await
        };

        ctx.guard(wait).await?
    }

    /// The run's result set: its result node's inputs in declared order.
    ///
    /// The result node comes from the graph stored with the run, so the
    /// answer does not change if the job is later redefined or removed.
    ///
    /// Fails fast with `RunNotTerminal` while the run is still executing; see
    /// [`await_results`](Self::await_results) for the blocking form.
    pub async fn results_for_run(&self, run_id: RunId) -> Result<Vec<TaskResult>, RunnerError> {
        let run = self
            .store
            .run(run_id)
            .await?
            .ok_or(RunnerError::RunNotFound(run_id))?;
        if !run.state.is_terminal() {
            return Err(RunnerError::RunNotTerminal(run_id));
        }

        let result_node = run
            .graph
            .iter()
            .find(|spec| spec.kind.is_result())
            .ok_or(RunnerError::RunErrored(run_id))?;
        let mut results = Vec::with_capacity(result_node.predecessors.len());
        for dot_id in &result_node.predecessors {
            let result = self
                .store
                .read_task_run(run_id, dot_id)
                .await?
                .and_then(|tr| tr.result())
                .ok_or(RunnerError::RunErrored(run_id))?;
            results.push(result);
        }
        Ok(results)
    }

    /// [`await_run`](Self::await_run) followed by
    /// [`results_for_run`](Self::results_for_run).
    pub async fn await_results(
        &self,
        run_id: RunId,
        ctx: &WaitContext,
    ) -> Result<Vec<TaskResult>, RunnerError> {
        self.await_run(run_id, ctx).await?;
        self.results_for_run(run_id).await
    }

    async fn ensure_accepting(&self) -> Result<(), RunnerError> {
        match self.state.lock().await.lifecycle {
            Lifecycle::Idle => Err(RunnerError::NotStarted),
            Lifecycle::Started => Ok(()),
            Lifecycle::Stopping | Lifecycle::Stopped => Err(RunnerError::ShuttingDown),
        }
    }

    async fn poll_until_terminal(&self, run_id: RunId) -> Result<RunState, RunnerError> {
        loop {
            let state = self.store.run_state(run_id).await?;
            if state.is_terminal() {
                return Ok(state);
            }
            debug!(run_id = run_id.0, state = %state, "Polling run state");
            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }

    /// Register and spawn a run. The caller holds the state lock, so the run
    /// is visible to waiters before `create_run` returns.
    fn spawn_run(
        &self,
        state: &mut RunnerState,
        run_id: RunId,
        graph: Arc<TaskGraph>,
        inputs: RunInputs,
    ) {
        let (tx, rx) = watch::channel(None);
        state.in_flight.insert(run_id, InFlight { done: rx });

        let ctx = TaskContext {
            run_id,
            vars: Arc::new(inputs),
            transport: self.transport.clone(),
            jobs: self.jobs.clone(),
        };
        let scheduler = RunScheduler::new(
            self.store.clone(),
            graph,
            ctx,
            self.permits.clone(),
            self.config.poll_interval(),
        );
        let registry = self.state.clone();

        tokio::spawn(async move {
            let final_state = scheduler.execute().await;
            let _ = tx.send(Some(final_state));
            registry.lock().await.in_flight.remove(&run_id);
        });
    }
}

/// Builder for constructing a Runner.
pub struct RunnerBuilder<S: ExecutionStore> {
    store: S,
    jobs: Option<Arc<dyn JobSource>>,
    transport: Option<Arc<dyn HttpTransport>>,
    config: RunnerConfig,
}

impl<S: ExecutionStore + 'static> RunnerBuilder<S> {
    /// Create a new builder with the given store.
    pub fn new(store: S) -> Self {
        Self {
            store,
            jobs: None,
            transport: None,
            config: RunnerConfig::default(),
        }
    }

    /// Set where job graphs and bridge URLs come from.
    pub fn job_source(mut self, jobs: Arc<dyn JobSource>) -> Self {
        self.jobs = Some(jobs);
        self
    }

    /// Set the HTTP transport. Defaults to a `reqwest` client.
    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the maximum concurrently executing tasks.
    pub fn max_concurrent(mut self, n: usize) -> Self {
        self.config.max_concurrent = n;
        self
    }

    /// Set the poll interval.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Build the runner.
    pub fn build(self) -> Result<Runner<S>, RunnerError> {
        let transport = match self.transport {
            Some(t) => t,
            None => Arc::new(ReqwestTransport::from_config(&self.config)?),
        };
        let jobs = self
            .jobs
            .unwrap_or_else(|| Arc::new(InMemoryJobSource::new()));

        Ok(Runner {
            store: Arc::new(self.store),
            jobs,
            transport,
            permits: Arc::new(Semaphore::new(self.config.max_concurrent.max(1))),
            config: self.config,
            state: Arc::new(Mutex::new(RunnerState {
                lifecycle: Lifecycle::Idle,
                in_flight: HashMap::new(),
            })),
        })
    }
}
