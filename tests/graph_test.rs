//! Graph construction from TaskSpecs and the structure queries.

use oracleflow::{
    GraphError, HttpConfig, InMemoryJobSource, JobError, JobId, JobSource, JsonParseConfig,
    MultiplyConfig, Task, TaskGraph, TaskKind, TaskSpec,
};
use rust_decimal::Decimal;
use serde_json::json;

fn ids<'a>(specs: impl IntoIterator<Item = &'a TaskSpec>) -> Vec<&'a str> {
    specs.into_iter().map(|s| s.dot_id.as_str()).collect()
}

fn chain() -> Vec<TaskSpec> {
    vec![
        TaskSpec::new("fetch", TaskKind::Http(HttpConfig::get("http://feed.test/$(asset)"))),
        TaskSpec::new(
            "parse",
            TaskKind::JsonParse(JsonParseConfig::new("price")),
        )
        .after("fetch"),
        TaskSpec::new("scale", TaskKind::Multiply(MultiplyConfig::new(Decimal::from(100))))
            .after("parse")
            .after("parse"),
        TaskSpec::new("out", TaskKind::Result).after("scale"),
    ]
}

#[test]
fn test_build_from_json_specs() {
    let specs: Vec<TaskSpec> = serde_json::from_value(json!([
        {"dot_id": "a", "type": "http", "url": "http://feed.test/a"},
        {"dot_id": "b", "type": "http", "method": "POST", "url": "http://feed.test/b", "body": "{}"},
        {"dot_id": "m", "type": "median", "allowed_faults": 1, "predecessors": ["a", "b"]},
        {"dot_id": "out", "type": "result", "predecessors": ["m"]}
    ]))
    .unwrap();

    let graph = TaskGraph::build(specs).unwrap();
    assert_eq!(graph.len(), 4);
    assert_eq!(ids(graph.entry_nodes()), vec!["a", "b"]);
    assert_eq!(ids(graph.predecessors("m").unwrap()), vec!["a", "b"]);
    assert_eq!(ids(graph.successors("a").unwrap()), vec!["m"]);
    assert_eq!(graph.result_node().dot_id, "out");
    assert!(graph.required_vars().is_empty());
}

#[test]
fn test_structure_queries() {
    let graph = TaskGraph::build(chain()).unwrap();

    assert_eq!(
        ids(graph.topological_order()),
        vec!["fetch", "parse", "scale", "out"]
    );
    // The repeated edge counts once.
    assert_eq!(ids(graph.predecessors("scale").unwrap()), vec!["parse"]);
    assert_eq!(graph.node("scale").unwrap().task().kind(), "multiply");
    assert!(graph.successors("out").unwrap().is_empty());
    assert!(graph.successors("missing").is_none());
    assert_eq!(
        graph.required_vars().into_iter().collect::<Vec<_>>(),
        vec!["asset".to_string()]
    );
}

#[test]
fn test_build_rejects_malformed_graphs() {
    let mut dup = chain();
    dup.push(TaskSpec::new("parse", TaskKind::Result));
    assert!(matches!(
        TaskGraph::build(dup),
        Err(GraphError::DuplicateNode(id)) if id == "parse"
    ));

    let mut dangling = chain();
    dangling[1] = dangling[1].clone().after("nowhere");
    assert!(matches!(
        TaskGraph::build(dangling),
        Err(GraphError::DanglingEdge { node, predecessor }) if node == "parse" && predecessor == "nowhere"
    ));

    let mut cyclic = chain();
    cyclic[0] = cyclic[0].clone().after("scale");
    assert!(matches!(TaskGraph::build(cyclic), Err(GraphError::CyclicGraph { .. })));

    let no_result: Vec<_> = chain().into_iter().take(3).collect();
    assert!(matches!(TaskGraph::build(no_result), Err(GraphError::NoResultNode)));

    let mut two_results = chain();
    two_results.push(TaskSpec::new("out2", TaskKind::Result).after("scale"));
    assert!(matches!(
        TaskGraph::build(two_results),
        Err(GraphError::MultipleResultNodes(names)) if names == vec!["out", "out2"]
    ));

    let mut result_feeds = chain();
    result_feeds.push(
        TaskSpec::new("after", TaskKind::Multiply(MultiplyConfig::new(Decimal::ONE))).after("out"),
    );
    assert!(matches!(
        TaskGraph::build(result_feeds),
        Err(GraphError::ResultNodeHasSuccessors(id)) if id == "out"
    ));

    let mut bad_method = chain();
    bad_method[0] = TaskSpec::new(
        "fetch",
        TaskKind::Http(HttpConfig {
            method: "NOT A METHOD".into(),
            url: "http://feed.test".into(),
            body: None,
        }),
    );
    assert!(matches!(
        TaskGraph::build(bad_method),
        Err(GraphError::InvalidTaskSpec { node, .. }) if node == "fetch"
    ));
}

#[tokio::test]
async fn test_job_source_resolution() {
    let jobs = InMemoryJobSource::new();
    jobs.register_graph(JobId(1), TaskGraph::build(chain()).unwrap())
        .await;
    jobs.register_dot(JobId(2), "a [type=http url=\"http://feed.test\"];")
        .await;
    jobs.register_dot(JobId(3), "a -> b;").await;
    jobs.register_bridge("price_feed", "http://bridge.test/price".parse().unwrap())
        .await;

    assert_eq!(jobs.resolve_graph(JobId(1)).await.unwrap().len(), 4);

    let dot = jobs.resolve_graph(JobId(2)).await.unwrap();
    assert_eq!(dot.result_node().dot_id, oracleflow::IMPLICIT_RESULT_ID);
    // Built once, then served from cache.
    let again = jobs.resolve_graph(JobId(2)).await.unwrap();
    assert!(std::sync::Arc::ptr_eq(&dot, &again));

    assert!(matches!(
        jobs.resolve_graph(JobId(3)).await,
        Err(JobError::Graph(GraphError::DanglingEdge { .. }))
    ));
    assert!(matches!(
        jobs.resolve_graph(JobId(9)).await,
        Err(JobError::UnknownJob(JobId(9)))
    ));

    assert_eq!(
        jobs.resolve_bridge_url("price_feed").await.unwrap().as_str(),
        "http://bridge.test/price"
    );
    assert!(matches!(
        jobs.resolve_bridge_url("nope").await,
        Err(JobError::UnknownBridge(name)) if name == "nope"
    ));

    assert!(jobs.remove_job(JobId(1)).await);
    assert!(!jobs.remove_job(JobId(1)).await);
}
