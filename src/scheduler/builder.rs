use std::collections::HashMap;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use super::graph::{GraphError, TaskGraph, TaskNode};
use crate::task::TaskSpec;

impl TaskGraph {
    /// Validate `specs` and build the graph.
    ///
    /// Fails on duplicate or dangling DotIDs, cycles, a missing or repeated
    /// result node, and task configurations that cannot be built. A predecessor
    /// listed twice counts once.
    pub fn build(specs: Vec<TaskSpec>) -> Result<TaskGraph, GraphError> {
        let mut index = HashMap::with_capacity(specs.len());
        for (i, spec) in specs.iter().enumerate() {
            if index.insert(spec.dot_id.clone(), i).is_some() {
                return Err(GraphError::DuplicateNode(spec.dot_id.clone()));
            }
        }

        let mut nodes = Vec::with_capacity(specs.len());
        for mut spec in specs {
            let mut predecessors = Vec::with_capacity(spec.predecessors.len());
            let mut seen = Vec::with_capacity(spec.predecessors.len());
            for pred in &spec.predecessors {
                let &p = index.get(pred).ok_or_else(|| GraphError::DanglingEdge {
                    node: spec.dot_id.clone(),
                    predecessor: pred.clone(),
                })?;
                if !predecessors.contains(&p) {
                    predecessors.push(p);
                    seen.push(pred.clone());
                }
            }
            spec.predecessors = seen;

            let task = spec
                .kind
                .build()
                .map_err(|reason| GraphError::InvalidTaskSpec {
                    node: spec.dot_id.clone(),
                    reason,
                })?;

            nodes.push(TaskNode {
                spec,
                task,
                predecessors,
                successors: Vec::new(),
            });
        }

        for i in 0..nodes.len() {
            for p in nodes[i].predecessors.clone() {
                nodes[p].successors.push(i);
            }
        }

        // Edge direction: predecessor -> node.
        let mut dag: DiGraphMap<usize, ()> = DiGraphMap::new();
        for (i, node) in nodes.iter().enumerate() {
            dag.add_node(i);
            for &p in &node.predecessors {
                dag.add_edge(p, i, ());
            }
        }
        let topo_order = toposort(&dag, None).map_err(|cycle| GraphError::CyclicGraph {
            node: nodes[cycle.node_id()].spec.dot_id.clone(),
        })?;

        let results: Vec<usize> = nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.spec.kind.is_result())
            .map(|(i, _)| i)
            .collect();
        let result = match results.as_slice() {
            [] => return Err(GraphError::NoResultNode),
            [only] => *only,
            many => {
                return Err(GraphError::MultipleResultNodes(
                    many.iter().map(|&i| nodes[i].spec.dot_id.clone()).collect(),
                ))
            }
        };
        if !nodes[result].successors.is_empty() {
            return Err(GraphError::ResultNodeHasSuccessors(
                nodes[result].spec.dot_id.clone(),
            ));
        }

        Ok(TaskGraph {
            nodes,
            index,
            result,
            topo_order,
        })
    }
}
