use async_trait::async_trait;
use serde_json::Value;

use super::{Task, TaskContext, TaskError, TaskResult};

/// Terminal sink collecting its predecessors' values in declared order.
///
/// Errored predecessors contribute `null`; the sink itself never fails.
#[derive(Debug)]
pub struct ResultTask;

#[async_trait]
impl Task for ResultTask {
    fn kind(&self) -> &'static str {
        "result"
    }

    fn tolerates_upstream_errors(&self) -> bool {
        true
    }

    async fn run(&self, _ctx: &TaskContext, inputs: &[TaskResult]) -> Result<Value, TaskError> {
        Ok(Value::Array(
            inputs
                .iter()
                .map(|input| match input.error {
                    Some(_) => Value::Null,
                    None => input.value.clone(),
                })
                .collect(),
        ))
    }
}
