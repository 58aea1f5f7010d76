//! In-memory implementation of ExecutionStore.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;

use super::store::{ExecutionStore, RunId, RunInputs, RunRecord, RunState, StoreError, TaskRun};
use crate::job::JobId;
use crate::task::{TaskResult, TaskSpec};

#[derive(Debug, Default)]
struct Inner {
    next_id: i64,
    runs: HashMap<RunId, RunRecord>,
    task_runs: HashMap<RunId, Vec<TaskRun>>,
}

/// Process-local execution store.
///
/// A single mutex serializes every operation, which makes the claim a plain
/// check-and-insert.
#[derive(Debug, Default)]
pub struct MemoryExecutionStore {
    inner: Mutex<Inner>,
}

impl MemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for MemoryExecutionStore {
    async fn create_run(
        &self,
        job_id: JobId,
        inputs: &RunInputs,
        graph: &[TaskSpec],
    ) -> Result<RunId, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.next_id += 1;
        let id = RunId(inner.next_id);
        inner.runs.insert(
            id,
            RunRecord {
                id,
                job_id,
                inputs: inputs.clone(),
                graph: graph.to_vec(),
                state: RunState::Pending,
                created_at: Utc::now(),
                finished_at: None,
            },
        );
        Ok(id)
    }

    async fn run(&self, run_id: RunId) -> Result<Option<RunRecord>, StoreError> {
        Ok(self.inner.lock().await.runs.get(&run_id).cloned())
    }

    async fn mark_running(&self, run_id: RunId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let run = inner
            .runs
            .get_mut(&run_id)
            .ok_or(StoreError::RunNotFound(run_id))?;
        transition(run, RunState::Running)
    }

    async fn mark_terminal(&self, run_id: RunId, state: RunState) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let run = inner
            .runs
            .get_mut(&run_id)
            .ok_or(StoreError::RunNotFound(run_id))?;
        if !state.is_terminal() {
            return Err(StoreError::InvalidTransition {
                run_id,
                from: run.state,
                to: state,
            });
        }
        transition(run, state)?;
        run.finished_at = Some(Utc::now());
        Ok(())
    }

    async fn claim_node(&self, run_id: RunId, dot_id: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.runs.contains_key(&run_id) {
            return Err(StoreError::RunNotFound(run_id));
        }
        let rows = inner.task_runs.entry(run_id).or_default();
        if rows.iter().any(|r| r.dot_id == dot_id) {
            return Ok(false);
        }
        rows.push(TaskRun {
            run_id,
            dot_id: dot_id.to_string(),
            value: Value::Null,
            error: None,
            created_at: Utc::now(),
            finished_at: None,
        });
        Ok(true)
    }

    async fn write_task_run(
        &self,
        run_id: RunId,
        dot_id: &str,
        result: &TaskResult,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let row = inner
            .task_runs
            .get_mut(&run_id)
            .and_then(|rows| rows.iter_mut().find(|r| r.dot_id == dot_id))
            .ok_or_else(|| StoreError::NotClaimed {
                run_id,
                dot_id: dot_id.to_string(),
            })?;
        if row.is_finished() {
            return Err(StoreError::AlreadyWritten {
                run_id,
                dot_id: dot_id.to_string(),
            });
        }
        row.value = result.value.clone();
        row.error = result.error.clone();
        row.finished_at = Some(Utc::now());
        Ok(())
    }

    async fn read_task_run(
        &self,
        run_id: RunId,
        dot_id: &str,
    ) -> Result<Option<TaskRun>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .task_runs
            .get(&run_id)
            .and_then(|rows| rows.iter().find(|r| r.dot_id == dot_id))
            .cloned())
    }

    async fn task_runs(&self, run_id: RunId) -> Result<Vec<TaskRun>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.task_runs.get(&run_id).cloned().unwrap_or_default())
    }

    async fn unfinished_runs(&self) -> Result<Vec<RunRecord>, StoreError> {
        let inner = self.inner.lock().await;
        let mut runs: Vec<_> = inner
            .runs
            .values()
            .filter(|r| !r.state.is_terminal())
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.id);
        Ok(runs)
    }

    async fn recover_orphans(&self) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock().await;
        let Inner {
            runs, task_runs, ..
        } = &mut *inner;

        let mut released = 0;
        for (run_id, rows) in task_runs.iter_mut() {
            let live = runs.get(run_id).is_some_and(|r| !r.state.is_terminal());
            if live {
                let before = rows.len();
                rows.retain(TaskRun::is_finished);
                released += before - rows.len();
            }
        }
        Ok(released)
    }
}

fn transition(run: &mut RunRecord, next: RunState) -> Result<(), StoreError> {
    if !run.state.can_transition_to(next) {
        return Err(StoreError::InvalidTransition {
            run_id: run.id,
            from: run.state,
            to: next,
        });
    }
    run.state = next;
    Ok(())
}
