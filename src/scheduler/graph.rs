use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use thiserror::Error;

use crate::task::{Task, TaskSpec};

/// Error raised while building a [`TaskGraph`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("cycle detected in task graph involving node '{node}'")]
    CyclicGraph { node: String },

    #[error("duplicate node: {0}")]
    DuplicateNode(String),

    #[error("dangling edge '{predecessor}' -> '{node}'")]
    DanglingEdge { node: String, predecessor: String },

    #[error("graph has no result node")]
    NoResultNode,

    #[error("graph has more than one result node: {0:?}")]
    MultipleResultNodes(Vec<String>),

    #[error("result node '{0}' must not have successors")]
    ResultNodeHasSuccessors(String),

    #[error("invalid task '{node}': {reason}")]
    InvalidTaskSpec { node: String, reason: String },

    #[error("parse error at line {line}: {message}")]
    Parse { line: usize, message: String },
}

/// One node of a built graph.
#[derive(Debug)]
pub struct TaskNode {
    pub spec: TaskSpec,
    pub(crate) task: Arc<dyn Task>,
    pub(crate) predecessors: Vec<usize>,
    pub(crate) successors: Vec<usize>,
}

impl TaskNode {
    pub fn dot_id(&self) -> &str {
        &self.spec.dot_id
    }

    pub fn task(&self) -> &Arc<dyn Task> {
        &self.task
    }
}

/// Immutable DAG of tasks.
///
/// Nodes keep the order in which they were declared. Each node's predecessors
/// keep the order in which they were listed, which is the order its task
/// receives its inputs in.
#[derive(Debug)]
pub struct TaskGraph {
    pub(crate) nodes: Vec<TaskNode>,
    pub(crate) index: HashMap<String, usize>,
    pub(crate) result: usize,
    pub(crate) topo_order: Vec<usize>,
}

impl TaskGraph {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, dot_id: &str) -> Option<&TaskNode> {
        self.index.get(dot_id).map(|&i| &self.nodes[i])
    }

    /// All nodes in declaration order.
    pub fn nodes(&self) -> impl Iterator<Item = &TaskNode> {
        self.nodes.iter()
    }

    /// Nodes with no predecessors, in declaration order.
    pub fn entry_nodes(&self) -> Vec<&TaskSpec> {
        self.nodes
            .iter()
            .filter(|n| n.predecessors.is_empty())
            .map(|n| &n.spec)
            .collect()
    }

    /// Direct successors of `dot_id`, or `None` for an unknown node.
    pub fn successors(&self, dot_id: &str) -> Option<Vec<&TaskSpec>> {
        let node = self.node(dot_id)?;
        Some(node.successors.iter().map(|&i| &self.nodes[i].spec).collect())
    }

    /// Direct predecessors of `dot_id` in declared order.
    pub fn predecessors(&self, dot_id: &str) -> Option<Vec<&TaskSpec>> {
        let node = self.node(dot_id)?;
        Some(node.predecessors.iter().map(|&i| &self.nodes[i].spec).collect())
    }

    /// The specs this graph was built from, in declaration order.
    ///
    /// `TaskGraph::build(graph.specs())` yields an equivalent graph.
    pub fn specs(&self) -> Vec<TaskSpec> {
        self.nodes.iter().map(|n| n.spec.clone()).collect()
    }

    pub fn result_node(&self) -> &TaskSpec {
        &self.nodes[self.result].spec
    }

    /// Nodes in a dependency-respecting order.
    pub fn topological_order(&self) -> Vec<&TaskSpec> {
        self.topo_order.iter().map(|&i| &self.nodes[i].spec).collect()
    }

    /// Run variables referenced by any task template.
    pub fn required_vars(&self) -> BTreeSet<String> {
        self.nodes
            .iter()
            .flat_map(|n| n.task.referenced_vars())
            .collect()
    }

    pub(crate) fn entry_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.predecessors.is_empty())
            .map(|(i, _)| i)
    }
}
