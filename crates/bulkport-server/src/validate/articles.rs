//! Article record validation

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use bulkport_common::coerce;

use super::users::{optional_datetime, optional_uuid};
use super::{present, FieldError};

// Kebab-case: no leading, trailing or doubled hyphens.
static SLUG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+(?:-[a-z0-9]+)*$").unwrap_or_else(|e| panic!("slug regex: {e}"))
});

pub const MAX_TITLE_LENGTH: usize = 500;

/// Article publication status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArticleStatus {
    Draft,
    Published,
    Archived,
}

impl ArticleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArticleStatus::Draft => "draft",
            ArticleStatus::Published => "published",
            ArticleStatus::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "draft" => Some(ArticleStatus::Draft),
            "published" => Some(ArticleStatus::Published),
            "archived" => Some(ArticleStatus::Archived),
            _ => None,
        }
    }
}

impl std::fmt::Display for ArticleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An article row after validation and normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedArticle {
    pub id: Option<Uuid>,
    pub slug: String,
    pub title: String,
    pub body: String,
    pub author_id: Uuid,
    pub tags: Vec<String>,
    pub status: ArticleStatus,
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Validate one article row.
///
/// The slug is the natural key. A draft may not carry `published_at`.
pub fn validate_article(map: &Map<String, Value>) -> Result<NormalizedArticle, Vec<FieldError>> {
    let mut errors = Vec::new();

    let slug = match present(map, "slug") {
        Some(v) => match coerce::as_trimmed_str(v) {
            Some(s) if SLUG_RE.is_match(&s) => Some(s),
            Some(_) | None => {
                errors.push(
                    FieldError::new("slug", "must be kebab-case (lowercase letters, digits, single hyphens)")
                        .with_value(v),
                );
                None
            },
        },
        None => {
            errors.push(FieldError::new("slug", "is required"));
            None
        },
    };

    let title = match present(map, "title") {
        Some(v) => match coerce::as_trimmed_str(v) {
            Some(s) if !s.is_empty() && s.len() <= MAX_TITLE_LENGTH => Some(s),
            Some(_) => {
                errors.push(
                    FieldError::new(
                        "title",
                        format!("must be between 1 and {} characters", MAX_TITLE_LENGTH),
                    )
                    .with_value(v),
                );
                None
            },
            None => {
                errors.push(FieldError::new("title", "must be a string").with_value(v));
                None
            },
        },
        None => {
            errors.push(FieldError::new("title", "is required"));
            None
        },
    };

    let body = match present(map, "body") {
        Some(v) => match v.as_str() {
            Some(s) if !s.trim().is_empty() => Some(s.to_string()),
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

    let author_id = match present(map, "author_id") {
        Some(v) => match coerce::coerce_uuid(v) {
            Some(id) => Some(id),
            None => {
                errors.push(FieldError::new("author_id", "must be a valid UUID").with_value(v));
                None
            },
        },
        None => {
            errors.push(FieldError::new("author_id", "is required"));
            None
        },
    };

    let tags = match present(map, "tags") {
        Some(v) => validate_tags(v, &mut errors),
        None => Vec::new(),
    };

    let status = match present(map, "status") {
        Some(v) => match coerce::as_trimmed_str(v).as_deref().and_then(ArticleStatus::parse) {
            Some(status) => Some(status),
            None => {
                errors.push(
                    FieldError::new("status", "must be one of: draft, published, archived")
                        .with_value(v),
                );
                None
            },
        },
        None => {
            errors.push(FieldError::new("status", "is required"));
            None
        },
    };

    let published_at = optional_datetime(map, "published_at", &mut errors);
    if status == Some(ArticleStatus::Draft) && present(map, "published_at").is_some() {
        errors.push(
            FieldError::new("published_at", "must be absent while status is draft")
                .with_value(map.get("published_at").unwrap_or(&Value::Null)),
        );
    }

    let id = optional_uuid(map, "id", &mut errors);
    let created_at = optional_datetime(map, "created_at", &mut errors);
    let updated_at = optional_datetime(map, "updated_at", &mut errors);

    match (slug, title, body, author_id, status) {
        (Some(slug), Some(title), Some(body), Some(author_id), Some(status))
            if errors.is_empty() =>
        {
            Ok(NormalizedArticle {
                id,
                slug,
                title,
                body,
                author_id,
                tags,
                status,
                published_at,
                created_at,
                updated_at,
            })
        },
        _ => Err(errors),
    }
}

/// Tags normalize to lowercase trimmed strings with duplicates removed,
/// first occurrence winning.
fn validate_tags(value: &Value, errors: &mut Vec<FieldError>) -> Vec<String> {
    let Some(items) = value.as_array() else {
        errors.push(FieldError::new("tags", "must be an array of strings").with_value(value));
        return Vec::new();
    };

    let mut seen = std::collections::HashSet::new();
    let mut tags = Vec::new();
    for item in items {
        match coerce::as_trimmed_str(item) {
            Some(tag) if !tag.is_empty() => {
                let tag = tag.to_lowercase();
                if seen.insert(tag.clone()) {
                    tags.push(tag);
                }
            },
            _ => {
                errors.push(
                    FieldError::new("tags", "entries must be non-empty strings").with_value(item),
                );
            },
        }
    }
    tags
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn author() -> String {
        Uuid::new_v4().to_string()
    }

    fn valid_row() -> Value {
        json!({
            "slug": "hello-world",
            "title": "Hello",
            "body": "Some text",
            "author_id": author(),
            "status": "published",
            "published_at": "2024-01-01T00:00:00Z"
        })
    }

    fn as_map(v: &Value) -> &Map<String, Value> {
        v.as_object().unwrap()
    }

    #[test]
    fn test_valid_article() {
        let article = validate_article(as_map(&valid_row())).unwrap();
        assert_eq!(article.slug, "hello-world");
        assert_eq!(article.status, ArticleStatus::Published);
        assert!(article.published_at.is_some());
        assert!(article.tags.is_empty());
    }

    #[test]
    fn test_bad_slugs() {
        for slug in ["Hello", "-lead", "trail-", "two--hyphens", "", "with space"] {
            let mut row = valid_row();
            row["slug"] = json!(slug);
            let errors = validate_article(as_map(&row)).unwrap_err();
            assert!(errors.iter().any(|e| e.field == "slug"), "{slug:?}");
        }
    }

    #[test]
    fn test_draft_with_published_at_rejected() {
        let mut row = valid_row();
        row["status"] = json!("draft");
        let errors = validate_article(as_map(&row)).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "published_at"));
    }

    #[test]
    fn test_draft_with_null_published_at_is_fine() {
        let mut row = valid_row();
        row["status"] = json!("draft");
        row["published_at"] = json!(null);
        let article = validate_article(as_map(&row)).unwrap();
        assert_eq!(article.status, ArticleStatus::Draft);
        assert!(article.published_at.is_none());
    }

    #[test]
    fn test_tags_normalized_and_deduped() {
        let mut row = valid_row();
        row["tags"] = json!([" Rust ", "rust", "Tokio"]);
        let article = validate_article(as_map(&row)).unwrap();
        assert_eq!(article.tags, vec!["rust", "tokio"]);
    }

    #[test]
    fn test_tags_reject_empty_entries() {
        let mut row = valid_row();
        row["tags"] = json!(["ok", ""]);
        let errors = validate_article(as_map(&row)).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "tags"));
    }

    #[test]
    fn test_title_length_cap() {
        let mut row = valid_row();
        row["title"] = json!("t".repeat(MAX_TITLE_LENGTH + 1));
        let errors = validate_article(as_map(&row)).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "title"));
    }

    #[test]
    fn test_author_id_required_uuid() {
        let mut row = valid_row();
        row["author_id"] = json!("12345");
        let errors = validate_article(as_map(&row)).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "author_id"));
    }
}
