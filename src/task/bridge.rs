//! Bridge (external adapter) task.

use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::http::fetch;
use super::template;
use super::{Task, TaskContext, TaskError, TaskResult};
use crate::job::JobError;

/// Configuration of a `bridge` node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Registered bridge name.
    pub name: String,
    /// JSON sent to the adapter as `data`; may contain `$(name)` placeholders.
    #[serde(default)]
    pub request_data: Option<String>,
}

impl BridgeConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            request_data: None,
        }
    }
}

/// Resolves a named adapter to its URL and POSTs to it.
#[derive(Debug)]
pub struct BridgeTask {
    name: String,
    request_data: Option<String>,
}

impl BridgeTask {
    pub fn new(config: &BridgeConfig) -> Result<Self, String> {
        if config.name.trim().is_empty() {
            return Err("bridge task requires a name".to_string());
        }
        Ok(Self {
            name: config.name.clone(),
            request_data: config.request_data.clone(),
        })
    }
}

#[async_trait]
impl Task for BridgeTask {
    fn kind(&self) -> &'static str {
        "bridge"
    }

    fn referenced_vars(&self) -> Vec<String> {
        self.request_data
            .as_deref()
            .map(template::referenced_vars)
            .unwrap_or_default()
    }

    async fn run(&self, ctx: &TaskContext, inputs: &[TaskResult]) -> Result<Value, TaskError> {
        let url = ctx
            .jobs
            .resolve_bridge_url(&self.name)
            .await
            .map_err(|e| match e {
                JobError::UnknownBridge(name) => TaskError::UnknownBridge { name },
                other => TaskError::invalid_config(other.to_string()),
            })?;

        let data = match self.request_data.as_deref() {
            Some(raw) => {
                let rendered = template::render(raw, &ctx.vars, inputs)?;
                serde_json::from_str::<Value>(&rendered).map_err(|e| TaskError::InvalidJson {
                    message: format!("bridge request data: {e}"),
                })?
            }
            None => json!({}),
        };
        let body = json!({ "id": ctx.run_id.0.to_string(), "data": data });

        fetch(ctx, Method::POST, url.as_str(), Some(body.to_string())).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::testing;

    #[tokio::test]
    async fn test_unregistered_bridge_fails() {
        let task = BridgeTask::new(&BridgeConfig::new("nope")).unwrap();
        let err = task.run(&testing::context(), &[]).await.unwrap_err();
        assert_eq!(
            err,
            TaskError::UnknownBridge {
                name: "nope".to_string()
            }
        );
    }

    #[test]
    fn test_empty_name_rejected() {
        assert!(BridgeTask::new(&BridgeConfig::new("  ")).is_err());
    }
}
