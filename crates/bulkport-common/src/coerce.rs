//! Loosely-typed value coercion
//!
//! Import rows arrive as `serde_json::Value` trees regardless of wire format
//! (CSV cells are strings, JSON rows carry native types). The validators work
//! against that tree through the explicit coercion functions in this module,
//! so downstream code never touches the untyped map directly.

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

/// Extract a string field, trimmed. Numbers are not silently stringified.
pub fn as_trimmed_str(value: &Value) -> Option<String> {
    value.as_str().map(|s| s.trim().to_string())
}

/// Extract a string field, accepting raw numbers as their decimal rendering.
///
/// CSV decodes every cell as a string while JSON may carry numeric ids;
/// both forms are accepted wherever a textual value is expected.
pub fn as_string_like(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Coerce a boolean from the accepted spellings:
/// `true`, `false`, `"true"`, `"false"`, `"1"`, `"0"`, `"yes"`, `"no"`, `1`, `0`.
pub fn coerce_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_i64() {
            Some(1) => Some(true),
            Some(0) => Some(false),
            _ => None,
        },
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Parse a UUID from a string field.
pub fn coerce_uuid(value: &Value) -> Option<Uuid> {
    value.as_str().and_then(|s| Uuid::parse_str(s.trim()).ok())
}

/// Parse an ISO-8601 / RFC 3339 date-time from a string field.
pub fn coerce_datetime(value: &Value) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s.trim()).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Render a value for inclusion in a row-error record.
///
/// Strings come back bare (no surrounding quotes); everything else is
/// JSON-encoded. Truncation to the storage limit happens at the job store.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_as_trimmed_str() {
        assert_eq!(as_trimmed_str(&json!("  hello ")).unwrap(), "hello");
        assert!(as_trimmed_str(&json!(42)).is_none());
        assert!(as_trimmed_str(&json!(null)).is_none());
    }

    #[test]
    fn test_as_string_like_accepts_numbers() {
        assert_eq!(as_string_like(&json!(42)).unwrap(), "42");
        assert_eq!(as_string_like(&json!(" x ")).unwrap(), "x");
        assert!(as_string_like(&json!([1])).is_none());
    }

    #[test]
    fn test_coerce_bool_spellings() {
        for v in [json!(true), json!("true"), json!("1"), json!("yes"), json!(1)] {
            assert_eq!(coerce_bool(&v), Some(true), "{v:?}");
        }
        for v in [json!(false), json!("false"), json!("0"), json!("no"), json!(0)] {
            assert_eq!(coerce_bool(&v), Some(false), "{v:?}");
        }
        assert_eq!(coerce_bool(&json!("maybe")), None);
        assert_eq!(coerce_bool(&json!(2)), None);
        assert_eq!(coerce_bool(&json!(null)), None);
    }

    #[test]
    fn test_coerce_uuid() {
        let id = Uuid::new_v4();
        assert_eq!(coerce_uuid(&json!(id.to_string())).unwrap(), id);
        assert!(coerce_uuid(&json!("not-a-uuid")).is_none());
        assert!(coerce_uuid(&json!(12)).is_none());
    }

    #[test]
    fn test_coerce_datetime() {
        let dt = coerce_datetime(&json!("2024-01-01T00:00:00Z")).unwrap();
        assert_eq!(dt.to_rfc3339(), "2024-01-01T00:00:00+00:00");
        assert!(coerce_datetime(&json!("yesterday")).is_none());
    }

    #[test]
    fn test_display_value() {
        assert_eq!(display_value(&json!("plain")), "plain");
        assert_eq!(display_value(&json!(7)), "7");
        assert_eq!(display_value(&json!({"a": 1})), r#"{"a":1}"#);
    }
}
