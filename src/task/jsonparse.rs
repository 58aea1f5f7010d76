//! JSON path extraction task.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{expect_inputs, Task, TaskContext, TaskError, TaskResult};

/// Configuration of a `jsonparse` node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonParseConfig {
    /// `data,result` or `$.data.result`; numeric segments index arrays.
    pub path: String,
    /// Yield `null` instead of failing when the path is missing.
    #[serde(default)]
    pub lax: bool,
}

impl JsonParseConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            lax: false,
        }
    }
}

#[derive(Debug)]
pub struct JsonParseTask {
    path: String,
    segments: Vec<String>,
    lax: bool,
}

impl JsonParseTask {
    pub fn new(config: &JsonParseConfig) -> Self {
        Self {
            path: config.path.clone(),
            segments: parse_path(&config.path),
            lax: config.lax,
        }
    }
}

#[async_trait]
impl Task for JsonParseTask {
    fn kind(&self) -> &'static str {
        "jsonparse"
    }

    async fn run(&self, _ctx: &TaskContext, inputs: &[TaskResult]) -> Result<Value, TaskError> {
        expect_inputs(inputs, 1)?;

        let raw = match &inputs[0].value {
            Value::String(s) => s,
            other => {
                return Err(TaskError::InvalidJson {
                    message: format!("expected a JSON document string, got {other}"),
                })
            }
        };
        let doc: Value = serde_json::from_str(raw).map_err(|e| TaskError::InvalidJson {
            message: e.to_string(),
        })?;

        match lookup(&doc, &self.segments) {
            Some(found) => Ok(found.clone()),
            None if self.lax => Ok(Value::Null),
            None => Err(TaskError::ParsePathNotFound {
                path: self.path.clone(),
            }),
        }
    }
}

fn parse_path(path: &str) -> Vec<String> {
    let trimmed = path.trim();
    let trimmed = trimmed
        .strip_prefix("$.")
        .or_else(|| trimmed.strip_prefix('$'))
        .unwrap_or(trimmed);
    let sep = if trimmed.contains(',') { ',' } else { '.' };
    trimmed
        .split(sep)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn lookup<'a>(mut current: &'a Value, segments: &[String]) -> Option<&'a Value> {
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}
