use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::numeric::{to_decimal, to_value};
use super::{expect_inputs, Task, TaskContext, TaskError, TaskResult};

/// Configuration of a `multiply` node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiplyConfig {
    pub times: Decimal,
}

impl MultiplyConfig {
    pub fn new(times: Decimal) -> Self {
        Self { times }
    }
}

/// Multiplies its single numeric input by a fixed factor.
#[derive(Debug)]
pub struct MultiplyTask {
    times: Decimal,
}

impl MultiplyTask {
    pub fn new(config: &MultiplyConfig) -> Self {
        Self {
            times: config.times,
        }
    }
}

#[async_trait]
impl Task for MultiplyTask {
    fn kind(&self) -> &'static str {
        "multiply"
    }

    async fn run(&self, _ctx: &TaskContext, inputs: &[TaskResult]) -> Result<Value, TaskError> {
        expect_inputs(inputs, 1)?;
        let input = to_decimal(&inputs[0].value)?;
        let product = input
            .checked_mul(self.times)
            .ok_or_else(|| TaskError::Overflow {
                message: format!("{input} * {}", self.times),
            })?;
        Ok(to_value(product))
    }
}
