//! Exact decimal coercion shared by the numeric task kinds.

use std::str::FromStr;

use rust_decimal::Decimal;
use serde_json::Value;

use super::TaskError;

/// Coerce a JSON number or numeric string into a decimal.
pub(crate) fn to_decimal(value: &Value) -> Result<Decimal, TaskError> {
    let parsed = match value {
        Value::Number(n) => parse(&n.to_string()),
        Value::String(s) => parse(s.trim()),
        _ => None,
    };
    parsed.ok_or_else(|| TaskError::NotNumeric {
        value: value.to_string(),
    })
}

/// Render a decimal the way numeric tasks persist it: a string with no
/// trailing zeros.
pub(crate) fn to_value(d: Decimal) -> Value {
    Value::String(d.normalize().to_string())
}

fn parse(s: &str) -> Option<Decimal> {
    Decimal::from_str(s)
        .or_else(|_| Decimal::from_scientific(s))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_number_and_string_coercion() {
        assert_eq!(to_decimal(&json!(62.57)).unwrap(), Decimal::from_str("62.57").unwrap());
        assert_eq!(to_decimal(&json!(" 6194.2 ")).unwrap(), Decimal::from_str("6194.2").unwrap());
        assert_eq!(to_decimal(&json!("1e3")).unwrap(), Decimal::from(1000));
    }

    #[test]
    fn test_non_numeric_rejected() {
        assert!(matches!(to_decimal(&json!("abc")), Err(TaskError::NotNumeric { .. })));
        assert!(matches!(to_decimal(&json!(true)), Err(TaskError::NotNumeric { .. })));
        assert!(matches!(to_decimal(&json!(null)), Err(TaskError::NotNumeric { .. })));
    }

    #[test]
    fn test_normalized_rendering() {
        let d = Decimal::from_str("6257.00").unwrap();
        assert_eq!(to_value(d), json!("6257"));
    }
}
