//! Record validation
//!
//! Pure per-resource validation: each function takes one decoded row as a
//! `serde_json::Value` tree and produces either a strongly-typed normalized
//! record or the full list of field errors for that row. Nothing here
//! touches the database; referential checks happen in the upsert engine.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::jobs::models::ResourceType;

pub mod articles;
pub mod comments;
pub mod users;

pub use articles::{validate_article, ArticleStatus, NormalizedArticle};
pub use comments::{validate_comment, NormalizedComment};
pub use users::{validate_user, NormalizedUser, UserRole};

/// One field-level validation failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            value: None,
        }
    }

    pub fn with_value(mut self, value: &Value) -> Self {
        self.value = Some(bulkport_common::coerce::display_value(value));
        self
    }
}

/// A record that passed validation, normalized for upsert.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidRecord {
    User(NormalizedUser),
    Article(NormalizedArticle),
    Comment(NormalizedComment),
}

/// Validate one decoded row for the given resource kind.
pub fn validate_record(
    resource_type: ResourceType,
    value: &Value,
) -> Result<ValidRecord, Vec<FieldError>> {
    let Some(map) = value.as_object() else {
        return Err(vec![
            FieldError::new("record", "must be a JSON object").with_value(value)
        ]);
    };

    match resource_type {
        ResourceType::Users => validate_user(map).map(ValidRecord::User),
        ResourceType::Articles => validate_article(map).map(ValidRecord::Article),
        ResourceType::Comments => validate_comment(map).map(ValidRecord::Comment),
    }
}

/// A field counts as present when the key exists with a non-null value.
pub(crate) fn present<'a>(
    map: &'a serde_json::Map<String, Value>,
    field: &str,
) -> Option<&'a Value> {
    map.get(field).filter(|v| !v.is_null())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_non_object_row_is_rejected() {
        let err = validate_record(ResourceType::Users, &json!([1, 2])).unwrap_err();
        assert_eq!(err.len(), 1);
        assert_eq!(err[0].field, "record");
    }

    #[test]
    fn test_null_field_counts_as_absent() {
        let map = json!({"a": null, "b": 1});
        let map = map.as_object().expect("object");
        assert!(present(map, "a").is_none());
        assert!(present(map, "b").is_some());
        assert!(present(map, "c").is_none());
    }
}
