//! Task graphs and the per-run scheduler that executes them.

mod builder;
mod dot;
mod graph;
mod run;

pub use dot::IMPLICIT_RESULT_ID;
pub use graph::{GraphError, TaskGraph, TaskNode};
pub(crate) use run::RunScheduler;
