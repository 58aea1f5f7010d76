//! Fault-tolerant median aggregation.
//!
//! The median runs even when some predecessors errored. Errored inputs are
//! dropped; the task fails only if fewer than the required number of valid
//! inputs remain.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::numeric::{to_decimal, to_value};
use super::{Task, TaskContext, TaskError, TaskResult};

/// Configuration of a `median` node.
///
/// At most one of `min_valid` and `allowed_faults` may be set. With neither,
/// a single valid input suffices.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MedianConfig {
    #[serde(default)]
    pub min_valid: Option<usize>,
    #[serde(default)]
    pub allowed_faults: Option<usize>,
}

#[derive(Debug)]
pub struct MedianTask {
    min_valid: Option<usize>,
    allowed_faults: Option<usize>,
}

impl MedianTask {
    pub fn new(config: &MedianConfig) -> Result<Self, String> {
        if config.min_valid.is_some() && config.allowed_faults.is_some() {
            return Err("median accepts min_valid or allowed_faults, not both".to_string());
        }
        Ok(Self {
            min_valid: config.min_valid,
            allowed_faults: config.allowed_faults,
        })
    }

    fn required(&self, total: usize) -> usize {
        let required = match (self.min_valid, self.allowed_faults) {
            (Some(min), _) => min,
            (None, Some(faults)) => total.saturating_sub(faults),
            (None, None) => 1,
        };
        required.max(1)
    }
}

#[async_trait]
impl Task for MedianTask {
    fn kind(&self) -> &'static str {
        "median"
    }

    fn tolerates_upstream_errors(&self) -> bool {
        true
    }

    async fn run(&self, _ctx: &TaskContext, inputs: &[TaskResult]) -> Result<Value, TaskError> {
        let mut values = inputs
            .iter()
            .filter(|input| input.is_ok())
            .map(|input| to_decimal(&input.value))
            .collect::<Result<Vec<_>, _>>()?;

        let required = self.required(inputs.len());
        if values.len() < required {
            return Err(TaskError::InsufficientValidInputs {
                valid: values.len(),
                required,
            });
        }

        values.sort();
        median_of_sorted(&values).map(to_value)
    }
}

/// Median of a non-empty sorted slice; even lengths average the middle pair.
pub(crate) fn median_of_sorted(sorted: &[Decimal]) -> Result<Decimal, TaskError> {
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        return Ok(sorted[mid]);
    }
    let (low, high) = (sorted[mid - 1], sorted[mid]);
    low.checked_add(high)
        .map(|sum| sum / Decimal::TWO)
        .ok_or_else(|| TaskError::Overflow {
            message: format!("{low} + {high}"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::testing;
    use serde_json::json;

    fn ok(v: Value) -> TaskResult {
        TaskResult::ok(v)
    }

    fn failed() -> TaskResult {
        TaskResult::err(TaskError::NonSuccessStatus { status: 500 })
    }

    async fn median(config: MedianConfig, inputs: &[TaskResult]) -> Result<Value, TaskError> {
        MedianTask::new(&config)
            .unwrap()
            .run(&testing::context(), inputs)
            .await
    }

    #[tokio::test]
    async fn test_even_count_averages_middle_pair() {
        let value = median(MedianConfig::default(), &[ok(json!("6257")), ok(json!("6194.2"))])
            .await
            .unwrap();
        assert_eq!(value, json!("6225.6"));
    }

    #[tokio::test]
    async fn test_odd_count_takes_middle() {
        let value = median(
            MedianConfig::default(),
            &[ok(json!(3)), ok(json!("1")), ok(json!(2.5))],
        )
        .await
        .unwrap();
        assert_eq!(value, json!("2.5"));
    }

    #[tokio::test]
    async fn test_errored_inputs_are_skipped() {
        let value = median(MedianConfig::default(), &[failed(), ok(json!("10")), failed()])
            .await
            .unwrap();
        assert_eq!(value, json!("10"));
    }

    #[tokio::test]
    async fn test_allowed_faults_threshold() {
        let config = MedianConfig {
            allowed_faults: Some(1),
            ..Default::default()
        };
        let err = median(config, &[failed(), failed(), ok(json!("1"))])
            .await
            .unwrap_err();
        assert_eq!(err, TaskError::InsufficientValidInputs { valid: 1, required: 2 });
    }

    #[tokio::test]
    async fn test_all_inputs_failed() {
        let err = median(MedianConfig::default(), &[failed(), failed()])
            .await
            .unwrap_err();
        assert_eq!(err, TaskError::InsufficientValidInputs { valid: 0, required: 1 });
    }

    #[tokio::test]
    async fn test_non_numeric_valid_input_fails() {
        let err = median(MedianConfig::default(), &[ok(json!("1")), ok(json!("n/a"))])
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::NotNumeric { .. }));
    }

    #[tokio::test]
    async fn test_middle_pair_overflow_is_reported() {
        let max = Decimal::MAX.to_string();
        let err = median(MedianConfig::default(), &[ok(json!(&max)), ok(json!(&max))])
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Overflow { .. }));

        let value = median(MedianConfig::default(), &[ok(json!(&max)), ok(json!("-1"))])
            .await
            .unwrap();
        assert_eq!(value, json!("39614081257132168796771975167"));
    }

    #[test]
    fn test_conflicting_thresholds_rejected() {
        let config = MedianConfig {
            min_valid: Some(2),
            allowed_faults: Some(1),
        };
        assert!(MedianTask::new(&config).is_err());
    }
}
