//! Column type inference for decoded JSON values.

use serde_json::{Number, Value};
use teleforge_core::{ColumnType, NUMERIC_INTEGER_DIGITS, NUMERIC_SCALE};

/// Column type for a value: numbers are `Numeric`, strings `Text`,
/// everything else (bool, null, array, object) `Opaque`.
pub fn infer_type(value: &Value) -> ColumnType {
    match value {
        Value::Number(_) => ColumnType::Numeric,
        Value::String(_) => ColumnType::Text,
        Value::Null | Value::Bool(_) | Value::Array(_) | Value::Object(_) => {
            ColumnType::Opaque
        }
    }
}

/// Compact JSON text used for opaque columns.
pub fn canonical_json(value: &Value) -> String {
    value.to_string()
}

/// Whether `n` fits the numeric column type once rounded to its scale.
pub fn fits_numeric(n: &Number) -> bool {
    let limit = 10f64.powi(NUMERIC_INTEGER_DIGITS);
    let scale = 10f64.powi(NUMERIC_SCALE as i32);
    match n.as_f64() {
        Some(f) if f.is_finite() => ((f * scale).round() / scale).abs() < limit,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scalars() {
        assert_eq!(infer_type(&json!(3)), ColumnType::Numeric);
        assert_eq!(infer_type(&json!(3.14)), ColumnType::Numeric);
        assert_eq!(infer_type(&json!(-7)), ColumnType::Numeric);
        assert_eq!(infer_type(&json!("ok")), ColumnType::Text);
        assert_eq!(infer_type(&json!("")), ColumnType::Text);
    }

    #[test]
    fn everything_else_is_opaque() {
        assert_eq!(infer_type(&json!([1, 2])), ColumnType::Opaque);
        assert_eq!(infer_type(&json!(null)), ColumnType::Opaque);
        assert_eq!(infer_type(&json!(true)), ColumnType::Opaque);
        assert_eq!(infer_type(&json!({"a": 1})), ColumnType::Opaque);
    }

    #[test]
    fn inference_is_deterministic() {
        let v = json!({"nested": [1, "two"]});
        assert_eq!(infer_type(&v), infer_type(&v));
    }

    #[test]
    fn canonical_json_keeps_key_order() {
        let v: Value = serde_json::from_str(r#"{ "b": 1, "a": [true, null] }"#).unwrap();
        assert_eq!(canonical_json(&v), r#"{"b":1,"a":[true,null]}"#);
    }

    #[test]
    fn numeric_range() {
        assert!(fits_numeric(&Number::from(9_999_999_999i64)));
        assert!(!fits_numeric(&Number::from(10_000_000_000i64)));
        assert!(fits_numeric(&Number::from_f64(-21.5).unwrap()));
        assert!(!fits_numeric(&Number::from(u64::MAX)));
    }

    #[test]
    fn numeric_range_after_rounding() {
        assert!(fits_numeric(&Number::from_f64(9_999_999_999.9999).unwrap()));
        assert!(!fits_numeric(&Number::from_f64(9_999_999_999.99996).unwrap()));
        assert!(!fits_numeric(&Number::from_f64(-9_999_999_999.99996).unwrap()));
    }
}
