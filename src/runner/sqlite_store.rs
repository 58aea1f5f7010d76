//! SQLite implementation of ExecutionStore.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use sqlx::SqlitePool;

use super::store::{ExecutionStore, RunId, RunInputs, RunRecord, RunState, StoreError, TaskRun};
use crate::job::JobId;
use crate::task::{TaskError, TaskResult, TaskSpec};

type RunRow = (i64, i64, String, String, String, String, Option<String>);
type TaskRunRow = (i64, String, Option<String>, Option<String>, String, Option<String>);

const ALL_STATES: [RunState; 4] = [
    RunState::Pending,
    RunState::Running,
    RunState::Completed,
    RunState::Errored,
];

/// SQLite-backed execution store.
pub struct SqliteExecutionStore {
    pool: SqlitePool,
}

impl SqliteExecutionStore {
    /// Create a new SqliteExecutionStore.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Run migrations to create the run tables.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pipeline_runs (
                id INTEGER PRIMARY KEY,
                job_id INTEGER NOT NULL,
                inputs TEXT NOT NULL,
                graph TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL,
                finished_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::StorageError(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_pipeline_runs_state
            ON pipeline_runs(state, id)
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::StorageError(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pipeline_task_runs (
                id INTEGER PRIMARY KEY,
                run_id INTEGER NOT NULL REFERENCES pipeline_runs(id),
                dot_id TEXT NOT NULL,
                value TEXT,
                error TEXT,
                created_at TEXT NOT NULL,
                finished_at TEXT,
                UNIQUE(run_id, dot_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::StorageError(e.to_string()))?;

        Ok(())
    }

    async fn transition(&self, run_id: RunId, next: RunState) -> Result<(), StoreError> {
        let from: Vec<RunState> = ALL_STATES
            .into_iter()
            .filter(|s| s.can_transition_to(next))
            .collect();
        let placeholders = vec!["?"; from.len()].join(",");

        let finished_at = next.is_terminal().then(|| timestamp(Utc::now()));
        let update = format!(
            "UPDATE pipeline_runs SET state = ?, finished_at = COALESCE(?, finished_at) \
             WHERE id = ? AND state IN ({placeholders})"
        );
        let mut query = sqlx::query(&update)
            .bind(next.as_str())
            .bind(finished_at)
            .bind(run_id.0);
        for state in &from {
            query = query.bind(state.as_str());
        }
        let result = query
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::StorageError(e.to_string()))?;

        if result.rows_affected() == 0 {
            let current = self.run_state(run_id).await?;
            return Err(StoreError::InvalidTransition {
                run_id,
                from: current,
                to: next,
            });
        }
        Ok(())
    }

    async fn task_run_exists(&self, run_id: RunId, dot_id: &str) -> Result<bool, StoreError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM pipeline_task_runs
            WHERE run_id = ? AND dot_id = ?
            "#,
        )
        .bind(run_id.0)
        .bind(dot_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::StorageError(e.to_string()))?;
        Ok(count > 0)
    }
}

#[async_trait]
impl ExecutionStore for SqliteExecutionStore {
    async fn create_run(
        &self,
        job_id: JobId,
        inputs: &RunInputs,
        graph: &[TaskSpec],
    ) -> Result<RunId, StoreError> {
        let inputs_str = serde_json::to_string(inputs)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        let graph_str = serde_json::to_string(graph)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;

        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO pipeline_runs (job_id, inputs, graph, state, created_at)
            VALUES (?, ?, ?, 'pending', ?)
            RETURNING id
            "#,
        )
        .bind(job_id.0)
        .bind(inputs_str)
        .bind(graph_str)
        .bind(timestamp(Utc::now()))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::StorageError(e.to_string()))?;

        Ok(RunId(id))
    }

    async fn run(&self, run_id: RunId) -> Result<Option<RunRecord>, StoreError> {
        let row = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT id, job_id, inputs, graph, state, created_at, finished_at
            FROM pipeline_runs
            WHERE id = ?
            "#,
        )
        .bind(run_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::StorageError(e.to_string()))?;

        row.map(run_from_row).transpose()
    }

    async fn mark_running(&self, run_id: RunId) -> Result<(), StoreError> {
        self.transition(run_id, RunState::Running).await
    }

    async fn mark_terminal(&self, run_id: RunId, state: RunState) -> Result<(), StoreError> {
        if !state.is_terminal() {
            let current = self.run_state(run_id).await?;
            return Err(StoreError::InvalidTransition {
                run_id,
                from: current,
                to: state,
            });
        }
        self.transition(run_id, state).await
    }

    async fn claim_node(&self, run_id: RunId, dot_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO pipeline_task_runs (run_id, dot_id, created_at)
            SELECT ?, ?, ?
            WHERE EXISTS (SELECT 1 FROM pipeline_runs WHERE id = ?)
            ON CONFLICT(run_id, dot_id) DO NOTHING
            "#,
        )
        .bind(run_id.0)
        .bind(dot_id)
        .bind(timestamp(Utc::now()))
        .bind(run_id.0)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::StorageError(e.to_string()))?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        if self.run(run_id).await?.is_none() {
            return Err(StoreError::RunNotFound(run_id));
        }
        Ok(false)
    }

    async fn write_task_run(
        &self,
        run_id: RunId,
        dot_id: &str,
        result: &TaskResult,
    ) -> Result<(), StoreError> {
        let value = serde_json::to_string(&result.value)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        let error = result
            .error
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;

        let updated = sqlx::query(
            r#"
            UPDATE pipeline_task_runs
            SET value = ?, error = ?, finished_at = ?
            WHERE run_id = ? AND dot_id = ? AND finished_at IS NULL
            "#,
        )
        .bind(value)
        .bind(error)
        .bind(timestamp(Utc::now()))
        .bind(run_id.0)
        .bind(dot_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::StorageError(e.to_string()))?;

        if updated.rows_affected() == 1 {
            return Ok(());
        }
        if self.task_run_exists(run_id, dot_id).await? {
            Err(StoreError::AlreadyWritten {
                run_id,
                dot_id: dot_id.to_string(),
            })
        } else {
            Err(StoreError::NotClaimed {
                run_id,
                dot_id: dot_id.to_string(),
            })
        }
    }

    async fn read_task_run(
        &self,
        run_id: RunId,
        dot_id: &str,
    ) -> Result<Option<TaskRun>, StoreError> {
        let row = sqlx::query_as::<_, TaskRunRow>(
            r#"
            SELECT run_id, dot_id, value, error, created_at, finished_at
            FROM pipeline_task_runs
            WHERE run_id = ? AND dot_id = ?
            "#,
        )
        .bind(run_id.0)
        .bind(dot_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::StorageError(e.to_string()))?;

        row.map(task_run_from_row).transpose()
    }

    async fn task_runs(&self, run_id: RunId) -> Result<Vec<TaskRun>, StoreError> {
        let rows = sqlx::query_as::<_, TaskRunRow>(
            r#"
            SELECT run_id, dot_id, value, error, created_at, finished_at
            FROM pipeline_task_runs
            WHERE run_id = ?
            ORDER BY id
            "#,
        )
        .bind(run_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::StorageError(e.to_string()))?;

        rows.into_iter().map(task_run_from_row).collect()
    }

    async fn unfinished_runs(&self) -> Result<Vec<RunRecord>, StoreError> {
        let rows = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT id, job_id, inputs, graph, state, created_at, finished_at
            FROM pipeline_runs
            WHERE state IN ('pending', 'running')
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::StorageError(e.to_string()))?;

        rows.into_iter().map(run_from_row).collect()
    }

    async fn recover_orphans(&self) -> Result<usize, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM pipeline_task_runs
            WHERE finished_at IS NULL
              AND run_id IN (
                SELECT id FROM pipeline_runs WHERE state IN ('pending', 'running')
              )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::StorageError(e.to_string()))?;

        Ok(result.rows_affected() as usize)
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::DeserializationError(format!("timestamp '{raw}': {e}")))
}

fn run_from_row(row: RunRow) -> Result<RunRecord, StoreError> {
    let (id, job_id, inputs, graph, state, created_at, finished_at) = row;
    let inputs: RunInputs = serde_json::from_str(&inputs)
        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
    let graph: Vec<TaskSpec> = serde_json::from_str(&graph)
        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
    let state = RunState::parse(&state)
        .ok_or_else(|| StoreError::DeserializationError(format!("unknown run state '{state}'")))?;

    Ok(RunRecord {
        id: RunId(id),
        job_id: JobId(job_id),
        inputs,
        graph,
        state,
        created_at: parse_timestamp(&created_at)?,
        finished_at: finished_at.as_deref().map(parse_timestamp).transpose()?,
    })
}

fn task_run_from_row(row: TaskRunRow) -> Result<TaskRun, StoreError> {
    let (run_id, dot_id, value, error, created_at, finished_at) = row;
    let value: Value = match value {
        Some(raw) => serde_json::from_str(&raw)
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?,
        None => Value::Null,
    };
    let error: Option<TaskError> = error
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;

    Ok(TaskRun {
        run_id: RunId(run_id),
        dot_id,
        value,
        error,
        created_at: parse_timestamp(&created_at)?,
        finished_at: finished_at.as_deref().map(parse_timestamp).transpose()?,
    })
}
