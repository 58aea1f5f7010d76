//! Contract tests shared by every ExecutionStore implementation.

mod common;

use std::sync::Arc;

use oracleflow::{
    ExecutionStore, JobId, MemoryExecutionStore, MultiplyConfig, RunId, RunInputs, RunState,
    StoreError, TaskError, TaskKind, TaskResult, TaskSpec,
};
use serde_json::json;

async fn claim_is_won_exactly_once<S: ExecutionStore + 'static>(store: S) {
    let store = Arc::new(store);
    let run_id = store.create_run(JobId(1), &RunInputs::new(), &[]).await.unwrap();

    let claims: Vec<_> = (0..32)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.claim_node(run_id, "fetch").await.unwrap() })
        })
        .collect();

    let mut winners = 0;
    for claim in claims {
        if claim.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(store.task_runs(run_id).await.unwrap().len(), 1);
}

async fn write_requires_claim_and_happens_once<S: ExecutionStore>(store: S) {
    let run_id = store.create_run(JobId(1), &RunInputs::new(), &[]).await.unwrap();
    let result = TaskResult::ok(json!("42"));

    let err = store.write_task_run(run_id, "parse", &result).await.unwrap_err();
    assert!(matches!(err, StoreError::NotClaimed { ref dot_id, .. } if dot_id == "parse"));

    assert!(store.claim_node(run_id, "parse").await.unwrap());
    let pending = store.read_task_run(run_id, "parse").await.unwrap().unwrap();
    assert!(!pending.is_finished());
    assert_eq!(pending.result(), None);

    store.write_task_run(run_id, "parse", &result).await.unwrap();
    let err = store
        .write_task_run(run_id, "parse", &TaskResult::ok(json!("43")))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::AlreadyWritten { .. }));

    let written = store.read_task_run(run_id, "parse").await.unwrap().unwrap();
    assert_eq!(written.result(), Some(result));
    assert!(written.finished_at.unwrap() >= written.created_at);
}

async fn task_errors_survive_storage<S: ExecutionStore>(store: S) {
    let run_id = store.create_run(JobId(1), &RunInputs::new(), &[]).await.unwrap();
    let errors = [
        TaskError::NonSuccessStatus { status: 503 },
        TaskError::InsufficientValidInputs {
            valid: 1,
            required: 2,
        },
        TaskError::Panicked {
            message: "boom".into(),
        },
    ];

    for (i, error) in errors.iter().enumerate() {
        let dot_id = format!("node{i}");
        store.claim_node(run_id, &dot_id).await.unwrap();
        store
            .write_task_run(run_id, &dot_id, &TaskResult::err(error.clone()))
            .await
            .unwrap();
    }

    let rows = store.task_runs(run_id).await.unwrap();
    let stored: Vec<_> = rows.iter().map(|r| r.error.clone().unwrap()).collect();
    assert_eq!(stored, errors);
    assert!(rows.iter().all(|r| r.value.is_null()));
}

async fn run_state_transitions<S: ExecutionStore>(store: S) {
    let inputs = RunInputs::new().with("asset", json!("ETH"));
    let graph = vec![
        TaskSpec::new("scale", TaskKind::Multiply(MultiplyConfig::new(100.into()))),
        TaskSpec::new("out", TaskKind::Result).after("scale"),
    ];
    let run_id = store.create_run(JobId(7), &inputs, &graph).await.unwrap();

    let run = store.run(run_id).await.unwrap().unwrap();
    assert_eq!(run.job_id, JobId(7));
    assert_eq!(run.inputs, inputs);
    assert_eq!(run.graph, graph);
    assert_eq!(run.state, RunState::Pending);
    assert!(run.finished_at.is_none());

    let err = store
        .mark_terminal(run_id, RunState::Completed)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::InvalidTransition {
            from: RunState::Pending,
            to: RunState::Completed,
            ..
        }
    ));

    store.mark_running(run_id).await.unwrap();
    store.mark_running(run_id).await.unwrap();
    assert!(store.mark_terminal(run_id, RunState::Running).await.is_err());
    store.mark_terminal(run_id, RunState::Completed).await.unwrap();

    let run = store.run(run_id).await.unwrap().unwrap();
    assert_eq!(run.state, RunState::Completed);
    assert!(run.finished_at.is_some());

    // Terminal states are final.
    assert!(store.mark_running(run_id).await.is_err());
    assert!(store.mark_terminal(run_id, RunState::Errored).await.is_err());
    assert_eq!(store.run_state(run_id).await.unwrap(), RunState::Completed);

    assert!(store.run(RunId(9999)).await.unwrap().is_none());
    assert!(matches!(
        store.run_state(RunId(9999)).await,
        Err(StoreError::RunNotFound(RunId(9999)))
    ));
    assert!(matches!(
        store.claim_node(RunId(9999), "x").await,
        Err(StoreError::RunNotFound(_))
    ));
}

async fn orphans_released_only_for_live_runs<S: ExecutionStore>(store: S) {
    let live = store.create_run(JobId(1), &RunInputs::new(), &[]).await.unwrap();
    let done = store.create_run(JobId(1), &RunInputs::new(), &[]).await.unwrap();
    store.mark_running(live).await.unwrap();
    store.mark_running(done).await.unwrap();

    for run_id in [live, done] {
        store.claim_node(run_id, "written").await.unwrap();
        store
            .write_task_run(run_id, "written", &TaskResult::ok(json!(1)))
            .await
            .unwrap();
        store.claim_node(run_id, "orphan").await.unwrap();
    }
    store.mark_terminal(done, RunState::Errored).await.unwrap();

    assert_eq!(store.recover_orphans().await.unwrap(), 1);

    let live_rows = store.task_runs(live).await.unwrap();
    assert_eq!(live_rows.len(), 1);
    assert_eq!(live_rows[0].dot_id, "written");
    assert_eq!(store.task_runs(done).await.unwrap().len(), 2);

    // The released node can be claimed again.
    assert!(store.claim_node(live, "orphan").await.unwrap());
}

async fn unfinished_runs_oldest_first<S: ExecutionStore>(store: S) {
    let a = store.create_run(JobId(1), &RunInputs::new(), &[]).await.unwrap();
    let b = store.create_run(JobId(2), &RunInputs::new(), &[]).await.unwrap();
    let c = store.create_run(JobId(3), &RunInputs::new(), &[]).await.unwrap();
    store.mark_running(b).await.unwrap();
    store.mark_terminal(b, RunState::Completed).await.unwrap();
    store.mark_running(c).await.unwrap();

    let ids: Vec<_> = store
        .unfinished_runs()
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(ids, vec![a, c]);
}

#[tokio::test]
async fn test_memory_claim_is_won_exactly_once() {
    claim_is_won_exactly_once(MemoryExecutionStore::new()).await;
}

#[tokio::test]
async fn test_memory_write_requires_claim_and_happens_once() {
    write_requires_claim_and_happens_once(MemoryExecutionStore::new()).await;
}

#[tokio::test]
async fn test_memory_task_errors_survive_storage() {
    task_errors_survive_storage(MemoryExecutionStore::new()).await;
}

#[tokio::test]
async fn test_memory_run_state_transitions() {
    run_state_transitions(MemoryExecutionStore::new()).await;
}

#[tokio::test]
async fn test_memory_orphans_released_only_for_live_runs() {
    orphans_released_only_for_live_runs(MemoryExecutionStore::new()).await;
}

#[tokio::test]
async fn test_memory_unfinished_runs_oldest_first() {
    unfinished_runs_oldest_first(MemoryExecutionStore::new()).await;
}

#[cfg(feature = "sqlite")]
mod sqlite {
    use super::*;
    use crate::common::sqlite_store;

    #[tokio::test]
    async fn test_sqlite_claim_is_won_exactly_once() {
        claim_is_won_exactly_once(sqlite_store().await).await;
    }

    #[tokio::test]
    async fn test_sqlite_write_requires_claim_and_happens_once() {
        write_requires_claim_and_happens_once(sqlite_store().await).await;
    }

    #[tokio::test]
    async fn test_sqlite_task_errors_survive_storage() {
        task_errors_survive_storage(sqlite_store().await).await;
    }

    #[tokio::test]
    async fn test_sqlite_run_state_transitions() {
        run_state_transitions(sqlite_store().await).await;
    }

    #[tokio::test]
    async fn test_sqlite_orphans_released_only_for_live_runs() {
        orphans_released_only_for_live_runs(sqlite_store().await).await;
    }

    #[tokio::test]
    async fn test_sqlite_unfinished_runs_oldest_first() {
        unfinished_runs_oldest_first(sqlite_store().await).await;
    }
}
