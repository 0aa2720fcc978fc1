//! Comment record validation

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use bulkport_common::coerce;

use super::users::optional_datetime;
use super::{present, FieldError};

pub const MAX_BODY_CHARS: usize = 10_000;
pub const MAX_BODY_WORDS: usize = 500;

/// Client-facing comment ids may carry this prefix; it is stripped before
/// the UUID is used.
pub const COMMENT_ID_PREFIX: &str = "cm_";

/// A comment row after validation and normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedComment {
    pub id: Option<Uuid>,
    pub article_id: Uuid,
    pub user_id: Uuid,
    pub body: String,
    pub created_at: Option<DateTime<Utc>>,
}

/// Validate one comment row.
pub fn validate_comment(map: &Map<String, Value>) -> Result<NormalizedComment, Vec<FieldError>> {
    let mut errors = Vec::new();

    let id = match present(map, "id") {
        Some(v) => match comment_uuid(v) {
            Some(id) => Some(id),
            None => {
                errors.push(FieldError::new("id", "must be a valid UUID").with_value(v));
                None
            },
        },
        None => None,
    };

    let article_id = required_uuid(map, "article_id", &mut errors);
    let user_id = required_uuid(map, "user_id", &mut errors);

    let body = match present(map, "body") {
        Some(v) => match v.as_str() {
            Some(s) if !s.trim().is_empty() => {
                let char_count = s.chars().count();
                let word_count = s.split_whitespace().count();
                if char_count > MAX_BODY_CHARS {
                    errors.push(
                        FieldError::new(
                            "body",
                            format!("must be at most {} characters", MAX_BODY_CHARS),
                        )
                        .with_value(v),
                    );
                    None
                } else if word_count > MAX_BODY_WORDS {
                    errors.push(
                        FieldError::new(
                            "body",
                            format!("must be at most {} words", MAX_BODY_WORDS),
                        )
                        .with_value(v),
                    );
                    None
                } else {
                    Some(s.to_string())
                }
            },
            _ => {
                errors.push(FieldError::new("body", "must be a non-empty string").with_value(v));
                None
            },
        },
        None => {
            errors.push(FieldError::new("body", "is required"));
            None
        },
    };

    let created_at = optional_datetime(map, "created_at", &mut errors);

    match (article_id, user_id, body) {
        (Some(article_id), Some(user_id), Some(body)) if errors.is_empty() => {
            Ok(NormalizedComment {
                id,
                article_id,
                user_id,
                body,
                created_at,
            })
        },
        _ => Err(errors),
    }
}

/// Parse a comment id, accepting the `cm_` prefix.
fn comment_uuid(value: &Value) -> Option<Uuid> {
    let raw = value.as_str()?.trim();
    let raw = raw.strip_prefix(COMMENT_ID_PREFIX).unwrap_or(raw);
    Uuid::parse_str(raw).ok()
}

fn required_uuid(
    map: &Map<String, Value>,
    field: &str,
    errors: &mut Vec<FieldError>,
) -> Option<Uuid> {
    match present(map, field) {
        Some(v) => match coerce::coerce_uuid(v) {
            Some(id) => Some(id),
            None => {
                errors.push(FieldError::new(field, "must be a valid UUID").with_value(v));
                None
            },
        },
        None => {
            errors.push(FieldError::new(field, "is required"));
            None
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_row() -> Value {
        json!({
            "article_id": Uuid::new_v4().to_string(),
            "user_id": Uuid::new_v4().to_string(),
            "body": "looks good to me"
        })
    }

    fn as_map(v: &Value) -> &Map<String, Value> {
        v.as_object().unwrap()
    }

    #[test]
    fn test_valid_comment() {
        let comment = validate_comment(as_map(&valid_row())).unwrap();
        assert!(comment.id.is_none());
        assert_eq!(comment.body, "looks good to me");
    }

    #[test]
    fn test_prefixed_id_is_stripped() {
        let mut row = valid_row();
        let id = Uuid::new_v4();
        row["id"] = json!(format!("cm_{}", id));
        let comment = validate_comment(as_map(&row)).unwrap();
        assert_eq!(comment.id, Some(id));
    }

    #[test]
    fn test_plain_uuid_id_accepted() {
        let mut row = valid_row();
        let id = Uuid::new_v4();
        row["id"] = json!(id.to_string());
        let comment = validate_comment(as_map(&row)).unwrap();
        assert_eq!(comment.id, Some(id));
    }

    #[test]
    fn test_missing_references() {
        let row = json!({"body": "hi"});
        let errors = validate_comment(as_map(&row)).unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"article_id"));
        assert!(fields.contains(&"user_id"));
    }

    #[test]
    fn test_body_char_cap() {
        let mut row = valid_row();
        row["body"] = json!("x".repeat(MAX_BODY_CHARS + 1));
        let errors = validate_comment(as_map(&row)).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "body"));
    }

    #[test]
    fn test_body_word_cap() {
        let mut row = valid_row();
        row["body"] = json!(vec!["word"; MAX_BODY_WORDS + 1].join(" "));
        let errors = validate_comment(as_map(&row)).unwrap_err();
        let err = errors.iter().find(|e| e.field == "body").unwrap();
        assert!(err.message.contains("words"));
    }

    #[test]
    fn test_body_at_word_cap_is_fine() {
        let mut row = valid_row();
        row["body"] = json!(vec!["word"; MAX_BODY_WORDS].join(" "));
        assert!(validate_comment(as_map(&row)).is_ok());
    }
}
