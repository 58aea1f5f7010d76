//! Drives a single run through its task graph.
//!
//! Every node keeps a counter of unfinished predecessors. Entry nodes start
//! immediately; a node is spawned once its counter reaches zero, so its
//! predecessors' TaskRuns are always persisted before it reads them. Each node
//! must win the store's claim before executing, which keeps execution
//! exactly-once even if another scheduler works the same run.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::graph::TaskGraph;
use crate::runner::{ExecutionStore, RunState, StoreError};
use crate::task::{TaskContext, TaskError, TaskResult};

#[derive(Error, Debug)]
enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("worker lost: {0}")]
    Join(String),

    #[error("worker pool closed")]
    PoolClosed,

    #[error("predecessor '{predecessor}' of '{dot_id}' has no written result")]
    MissingPredecessor { dot_id: String, predecessor: String },
}

/// An infrastructure failure while running one node.
#[derive(Debug)]
struct NodeFailure {
    index: usize,
    /// Whether this scheduler holds the node's claim.
    claimed: bool,
    error: SchedulerError,
}

struct Shared<S> {
    store: Arc<S>,
    graph: Arc<TaskGraph>,
    ctx: TaskContext,
    permits: Arc<Semaphore>,
    poll_interval: Duration,
}

/// Executes one run to a terminal state.
pub(crate) struct RunScheduler<S> {
    shared: Arc<Shared<S>>,
}

impl<S: ExecutionStore + 'static> RunScheduler<S> {
    pub(crate) fn new(
        store: Arc<S>,
        graph: Arc<TaskGraph>,
        ctx: TaskContext,
        permits: Arc<Semaphore>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                graph,
                ctx,
                permits,
                poll_interval,
            }),
        }
    }

    /// Run every node, then mark the run terminal.
    ///
    /// Returns the state the run ended in. Task failures never make a run
    /// `Errored`; only an unwritten result node or an infrastructure failure do.
    pub(crate) async fn execute(self) -> RunState {
        let run_id = self.shared.ctx.run_id;
        info!(run_id = run_id.0, nodes = self.shared.graph.len(), "Starting run");

        let state = match self.drive().await {
            Ok(state) => state,
            Err(e) => {
                error!(run_id = run_id.0, error = %e, "Run aborted");
                RunState::Errored
            }
        };

        if let Err(e) = self.shared.store.mark_terminal(run_id, state).await {
            // Another scheduler may have finished the run first.
            return match self.shared.store.run_state(run_id).await {
                Ok(current) if current.is_terminal() => {
                    debug!(run_id = run_id.0, state = %current, "Run already finished elsewhere");
                    current
                }
                _ => {
                    error!(run_id = run_id.0, error = %e, "Failed to mark run terminal");
                    RunState::Errored
                }
            };
        }

        info!(run_id = run_id.0, state = %state, "Run finished");
        state
    }

    async fn drive(&self) -> Result<RunState, SchedulerError> {
        let shared = &self.shared;
        let run_id = shared.ctx.run_id;
        shared.store.mark_running(run_id).await?;

        let mut remaining: Vec<usize> = shared
            .graph
            .nodes
            .iter()
            .map(|n| n.predecessors.len())
            .collect();

        let mut workers = JoinSet::new();
        for index in shared.graph.entry_indices() {
            workers.spawn(run_node(shared.clone(), index));
        }

        // After the first failure nothing new is spawned, but workers already
        // running are joined so their results still reach the store.
        let mut failure: Option<SchedulerError> = None;
        let mut aborted = Vec::new();
        while let Some(joined) = workers.join_next().await {
            let finished = match joined {
                Ok(Ok(index)) => index,
                Ok(Err(f)) => {
                    error!(
                        run_id = run_id.0,
                        dot_id = shared.graph.nodes[f.index].dot_id(),
                        error = %f.error,
                        "Node failed; draining run"
                    );
                    if f.claimed {
                        aborted.push(f.index);
                    }
                    failure.get_or_insert(f.error);
                    continue;
                }
                Err(e) => {
                    error!(run_id = run_id.0, error = %e, "Worker lost; draining run");
                    failure.get_or_insert(SchedulerError::Join(e.to_string()));
                    continue;
                }
            };
            if failure.is_some() {
                continue;
            }
            for &successor in &shared.graph.nodes[finished].successors {
                remaining[successor] -= 1;
                if remaining[successor] == 0 {
                    workers.spawn(run_node(shared.clone(), successor));
                }
            }
        }

        if let Some(error) = failure {
            abort_claims(shared, &aborted, &error).await;
            return Err(error);
        }

        let result_id = &shared.graph.result_node().dot_id;
        let written = shared
            .store
            .read_task_run(run_id, result_id)
            .await?
            .is_some_and(|tr| tr.is_finished());

        if written {
            Ok(RunState::Completed)
        } else {
            warn!(run_id = run_id.0, dot_id = %result_id, "Result node was never written");
            Ok(RunState::Errored)
        }
    }
}

/// Claim, execute and persist one node. Returns its index once its TaskRun
/// is written, by this scheduler or another.
async fn run_node<S: ExecutionStore>(
    shared: Arc<Shared<S>>,
    index: usize,
) -> Result<usize, NodeFailure> {
    let dot_id = shared.graph.nodes[index].dot_id();
    let failed = |claimed: bool, error: SchedulerError| NodeFailure {
        index,
        claimed,
        error,
    };

    let won = shared
        .store
        .claim_node(shared.ctx.run_id, dot_id)
        .await
        .map_err(|e| failed(false, e.into()))?;
    if won {
        execute_claimed(&shared, index)
            .await
            .map_err(|e| failed(true, e))?;
    } else {
        await_written(&shared, dot_id)
            .await
            .map_err(|e| failed(false, e))?;
    }
    Ok(index)
}

/// Execute a node this scheduler has claimed and write its TaskRun.
async fn execute_claimed<S: ExecutionStore>(
    shared: &Shared<S>,
    index: usize,
) -> Result<(), SchedulerError> {
    let node = &shared.graph.nodes[index];
    let run_id = shared.ctx.run_id;
    let dot_id = node.dot_id();

    let mut inputs = Vec::with_capacity(node.predecessors.len());
    for &p in &node.predecessors {
        let predecessor = shared.graph.nodes[p].dot_id();
        let result = shared
            .store
            .read_task_run(run_id, predecessor)
            .await?
            .and_then(|tr| tr.result())
            .ok_or_else(|| SchedulerError::MissingPredecessor {
                dot_id: dot_id.to_string(),
                predecessor: predecessor.to_string(),
            })?;
        inputs.push(result);
    }

    let upstream_error = inputs.iter().find_map(|i| i.error.clone());
    let result = match upstream_error {
        Some(err) if !node.task.tolerates_upstream_errors() => {
            debug!(run_id = run_id.0, dot_id, error = %err, "Propagating upstream error");
            TaskResult::err(err)
        }
        _ => {
            let _permit = shared
                .permits
                .acquire()
                .await
                .map_err(|_| SchedulerError::PoolClosed)?;
            debug!(run_id = run_id.0, dot_id, kind = node.task.kind(), "Executing task");

            let outcome = AssertUnwindSafe(node.task.run(&shared.ctx, &inputs))
                .catch_unwind()
                .await;
            match outcome {
                Ok(result) => TaskResult::from(result),
                Err(payload) => TaskResult::err(TaskError::Panicked {
                    message: panic_message(payload.as_ref()),
                }),
            }
        }
    };

    if let Some(err) = &result.error {
        debug!(run_id = run_id.0, dot_id, error = %err, "Task failed");
    }
    shared.store.write_task_run(run_id, dot_id, &result).await?;
    Ok(())
}

/// Persist an `Aborted` error for claims whose execution was cut short, so
/// no claim of a finished run stays unwritten.
async fn abort_claims<S: ExecutionStore>(
    shared: &Shared<S>,
    claimed: &[usize],
    cause: &SchedulerError,
) {
    let run_id = shared.ctx.run_id;
    let aborted = TaskResult::err(TaskError::Aborted {
        message: cause.to_string(),
    });
    for &index in claimed {
        let dot_id = shared.graph.nodes[index].dot_id();
        match shared.store.write_task_run(run_id, dot_id, &aborted).await {
            Ok(()) | Err(StoreError::AlreadyWritten { .. }) => {}
            Err(e) => {
                warn!(run_id = run_id.0, dot_id, error = %e, "Could not record aborted task");
            }
        }
    }
}

/// Poll until a node claimed elsewhere has been written.
async fn await_written<S: ExecutionStore>(
    shared: &Shared<S>,
    dot_id: &str,
) -> Result<(), SchedulerError> {
    let run_id = shared.ctx.run_id;
    loop {
        match shared.store.read_task_run(run_id, dot_id).await? {
            Some(tr) if tr.is_finished() => return Ok(()),
            _ => {
                debug!(run_id = run_id.0, dot_id, "Waiting on task claimed elsewhere");
                tokio::time::sleep(shared.poll_interval).await;
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
