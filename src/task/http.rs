//! HTTP fetch task.

use async_trait::async_trait;
use reqwest::{Method, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::template;
use super::{Task, TaskContext, TaskError, TaskResult};
use crate::transport::HttpRequest;

/// Configuration of an `http` node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_method")]
    pub method: String,
    /// Target URL; may contain `$(name)` placeholders.
    pub url: String,
    /// Optional request body; may contain `$(name)` placeholders.
    #[serde(default)]
    pub body: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl HttpConfig {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: default_method(),
            url: url.into(),
            body: None,
        }
    }

    pub fn post(url: impl Into<String>, body: Option<String>) -> Self {
        Self {
            method: "POST".to_string(),
            url: url.into(),
            body,
        }
    }
}

/// Fetches a URL and yields the raw response body as a string.
#[derive(Debug)]
pub struct HttpTask {
    method: Method,
    url: String,
    body: Option<String>,
}

impl HttpTask {
    pub fn new(config: &HttpConfig) -> Result<Self, String> {
        let method = parse_method(&config.method)?;
        if config.url.trim().is_empty() {
            return Err("http task requires a url".to_string());
        }
        Ok(Self {
            method,
            url: config.url.clone(),
            body: config.body.clone(),
        })
    }
}

#[async_trait]
impl Task for HttpTask {
    fn kind(&self) -> &'static str {
        "http"
    }

    fn referenced_vars(&self) -> Vec<String> {
        let mut vars = template::referenced_vars(&self.url);
        if let Some(body) = &self.body {
            vars.extend(template::referenced_vars(body));
        }
        vars
    }

    async fn run(&self, ctx: &TaskContext, inputs: &[TaskResult]) -> Result<Value, TaskError> {
        let url = template::render(&self.url, &ctx.vars, inputs)?;
        let body = self
            .body
            .as_deref()
            .map(|b| template::render(b, &ctx.vars, inputs))
            .transpose()?;
        fetch(ctx, self.method.clone(), &url, body).await
    }
}

pub(crate) fn parse_method(raw: &str) -> Result<Method, String> {
    Method::from_bytes(raw.trim().to_uppercase().as_bytes())
        .map_err(|_| format!("invalid HTTP method '{raw}'"))
}

/// Perform a request through the run's transport and check the status.
pub(crate) async fn fetch(
    ctx: &TaskContext,
    method: Method,
    url: &str,
    body: Option<String>,
) -> Result<Value, TaskError> {
    let url = Url::parse(url)
        .map_err(|e| TaskError::invalid_config(format!("invalid url '{url}': {e}")))?;

    debug!(run_id = ctx.run_id.0, %method, %url, "Sending task request");

    let response = ctx
        .transport
        .send(HttpRequest { method, url, body })
        .await
        .map_err(|e| TaskError::Transport {
            message: e.to_string(),
        })?;

    if !(200..300).contains(&response.status) {
        return Err(TaskError::NonSuccessStatus {
            status: response.status,
        });
    }

    Ok(Value::String(response.body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_is_validated() {
        assert!(HttpTask::new(&HttpConfig {
            method: "post".to_string(),
            url: "http://example.com".to_string(),
            body: None,
        })
        .is_ok());

        let err = HttpTask::new(&HttpConfig {
            method: "NOT A METHOD".to_string(),
            url: "http://example.com".to_string(),
            body: None,
        })
        .unwrap_err();
        assert!(err.contains("invalid HTTP method"));
    }

    #[test]
    fn test_referenced_vars_cover_url_and_body() {
        let task = HttpTask::new(&HttpConfig::post(
            "http://example.com/$(asset)",
            Some(r#"{"round": $(round), "prev": "$(input)"}"#.to_string()),
        ))
        .unwrap();
        assert_eq!(task.referenced_vars(), vec!["asset", "round"]);
    }

    #[tokio::test]
    async fn test_invalid_rendered_url_is_config_error() {
        let task = HttpTask::new(&HttpConfig::get("not a url")).unwrap();
        let err = task.run(&crate::task::testing::context(), &[]).await.unwrap_err();
        assert!(matches!(err, TaskError::InvalidConfig { .. }));
    }
}
