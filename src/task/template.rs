//! `$(name)` placeholder substitution for request templates.

use serde_json::Value;

use super::{TaskError, TaskResult};
use crate::runner::RunInputs;

/// Placeholder bound to the first predecessor's value.
pub(crate) const INPUT_PLACEHOLDER: &str = "input";

/// Names of all placeholders in `template`, in order of appearance.
pub(crate) fn placeholders(template: &str) -> Vec<&str> {
    let mut names = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find("$(") {
        let after = &rest[start + 2..];
        match after.find(')') {
            Some(end) => {
                names.push(after[..end].trim());
                rest = &after[end + 1..];
            }
            None => break,
        }
    }
    names
}

/// Run variables referenced by `template`, excluding `$(input)`.
pub(crate) fn referenced_vars(template: &str) -> Vec<String> {
    placeholders(template)
        .into_iter()
        .filter(|name| *name != INPUT_PLACEHOLDER)
        .map(str::to_string)
        .collect()
}

/// Substitute every placeholder in `template`.
pub(crate) fn render(
    template: &str,
    vars: &RunInputs,
    inputs: &[TaskResult],
) -> Result<String, TaskError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("$(") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find(')') else {
            out.push_str(&rest[start..]);
            return Ok(out);
        };
        let name = after[..end].trim();
        let value = if name == INPUT_PLACEHOLDER {
            inputs.first().map(|input| &input.value)
        } else {
            vars.get(name)
        };
        let value = value.ok_or_else(|| {
            TaskError::invalid_config(format!("unresolved placeholder $({name})"))
        })?;
        out.push_str(&value_as_text(value));
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    Ok(out)
}

fn value_as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
