//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::sync::{Arc, Once};
use std::time::Duration;

use oracleflow::{
    ExecutionStore, InMemoryJobSource, JobId, Runner, RunnerBuilder, TaskGraph, TaskResult,
    TaskSpec,
};
use reqwest::Url;
use serde_json::json;
use tracing_subscriber::{fmt, EnvFilter};
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

static INIT: Once = Once::new();

/// Initialise tracing for tests (idempotent).
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .init();
    });
}

pub const TURNOUT_JOB: JobId = JobId(1);

/// The two-branch election pipeline and the servers backing it.
pub fn turnout_dot(http_url: &str) -> String {
    format!(
        r#"
        // data source 1
        ds1          [type=bridge name=voter_turnout];
        ds1_parse    [type=jsonparse path="data,result"];
        ds1_multiply [type=multiply times=100];

        // data source 2
        ds2          [type=http method=POST url="{http_url}" body=<{{"hi": "hello"}}>];
        ds2_parse    [type=jsonparse path="turnout"];
        ds2_multiply [type=multiply times=100];

        ds1 -> ds1_parse -> ds1_multiply -> answer1;
        ds2 -> ds2_parse -> ds2_multiply -> answer1;

        answer1 [type=median index=0];
        answer2 [type=bridge name=election_winner index=1];
        "#
    )
}

/// Mock servers must outlive the runs that call them.
pub struct Turnout {
    pub jobs: Arc<InMemoryJobSource>,
    pub election_winner: MockServer,
    pub voter_turnout: MockServer,
    pub http: MockServer,
}

pub async fn post_server(status: u16, body: &str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(status).set_body_string(body))
        .mount(&server)
        .await;
    server
}

pub fn url(server: &MockServer) -> Url {
    Url::parse(&server.uri()).unwrap()
}

pub async fn turnout() -> Turnout {
    turnout_with_http(post_server(200, r#"{"turnout": 61.942}"#).await).await
}

/// The election pipeline with `http` standing in for data source 2.
pub async fn turnout_with_http(http: MockServer) -> Turnout {
    let election_winner = post_server(200, "Hal Finney").await;
    let voter_turnout = post_server(200, r#"{"data": {"result": 62.57}}"#).await;

    let jobs = Arc::new(InMemoryJobSource::new());
    jobs.register_bridge("election_winner", url(&election_winner))
        .await;
    jobs.register_bridge("voter_turnout", url(&voter_turnout)).await;
    jobs.register_dot(TURNOUT_JOB, turnout_dot(&http.uri())).await;

    Turnout {
        jobs,
        election_winner,
        voter_turnout,
        http,
    }
}

pub fn runner<S: ExecutionStore + 'static>(store: S, jobs: Arc<InMemoryJobSource>) -> Runner<S> {
    RunnerBuilder::new(store)
        .job_source(jobs)
        .max_concurrent(4)
        .poll_interval(Duration::from_millis(10))
        .build()
        .unwrap()
}

pub async fn started<S: ExecutionStore + 'static>(
    store: S,
    jobs: Arc<InMemoryJobSource>,
) -> Runner<S> {
    let runner = runner(store, jobs);
    runner.start().await.unwrap();
    runner
}

/// The graph a run of `dot` pins when it is created.
pub fn specs(dot: &str) -> Vec<TaskSpec> {
    TaskGraph::from_dot(dot).unwrap().specs()
}

pub fn ok(value: serde_json::Value) -> TaskResult {
    TaskResult::ok(value)
}

pub fn expected_turnout_results() -> Vec<TaskResult> {
    vec![ok(json!("6225.6")), ok(json!("Hal Finney"))]
}

#[cfg(feature = "sqlite")]
pub async fn sqlite_store() -> oracleflow::SqliteExecutionStore {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let store = oracleflow::SqliteExecutionStore::new(pool);
    store.run_migrations().await.unwrap();
    store
}
