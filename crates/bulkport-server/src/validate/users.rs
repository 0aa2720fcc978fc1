//! User record validation

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use bulkport_common::coerce;

use super::{present, FieldError};

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").unwrap_or_else(|e| panic!("email regex: {e}"))
});

pub const MAX_EMAIL_LENGTH: usize = 255;
pub const MAX_NAME_LENGTH: usize = 255;

/// User role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    Manager,
    Author,
    Editor,
    Reader,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Admin => "admin",
            UserRole::Manager => "manager",
            UserRole::Author => "author",
            UserRole::Editor => "editor",
            UserRole::Reader => "reader",
        }
    }

    /// Parse a role, case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "admin" => Some(UserRole::Admin),
            "manager" => Some(UserRole::Manager),
            "author" => Some(UserRole::Author),
            "editor" => Some(UserRole::Editor),
            "reader" => Some(UserRole::Reader),
            _ => None,
        }
    }
}

impl std::fmt::Display for UserRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user row after validation and normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedUser {
    pub id: Option<Uuid>,
    pub email: String,
    pub name: String,
    pub role: UserRole,
    pub active: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Validate one user row.
///
/// The email comes back trimmed and lowercased; it is the natural key for
/// upserts. Every failing field is reported, not just the first.
pub fn validate_user(map: &Map<String, Value>) -> Result<NormalizedUser, Vec<FieldError>> {
    let mut errors = Vec::new();

    let email = match present(map, "email") {
        Some(v) => match coerce::as_trimmed_str(v) {
            Some(s) if !s.is_empty() => {
                let normalized = s.to_lowercase();
                if normalized.len() > MAX_EMAIL_LENGTH {
                    errors.push(
                        FieldError::new(
                            "email",
                            format!("must be at most {} characters", MAX_EMAIL_LENGTH),
                        )
                        .with_value(v),
                    );
                    None
                } else if !EMAIL_RE.is_match(&normalized) {
                    errors.push(
                        FieldError::new("email", "must be a valid email address").with_value(v),
                    );
                    None
                } else {
                    Some(normalized)
                }
            },
            _ => {
                errors.push(FieldError::new("email", "must be a non-empty string").with_value(v));
                None
            },
        },
        None => {
            errors.push(FieldError::new("email", "is required"));
            None
        },
    };

    let name = match present(map, "name") {
        Some(v) => match coerce::as_trimmed_str(v) {
            Some(s) if !s.is_empty() && s.len() <= MAX_NAME_LENGTH => Some(s),
            Some(_) => {
                errors.push(
                    FieldError::new(
                        "name",
                        format!("must be between 1 and {} characters", MAX_NAME_LENGTH),
                    )
                    .with_value(v),
                );
                None
            },
            None => {
                errors.push(FieldError::new("name", "must be a string").with_value(v));
                None
            },
        },
        None => {
            errors.push(FieldError::new("name", "is required"));
            None
        },
    };

    let role = match present(map, "role") {
        Some(v) => match coerce::as_trimmed_str(v).as_deref().and_then(UserRole::parse) {
            Some(role) => Some(role),
            None => {
                errors.push(
                    FieldError::new(
                        "role",
                        "must be one of: admin, manager, author, editor, reader",
                    )
                    .with_value(v),
                );
                None
            },
        },
        None => {
            errors.push(FieldError::new("role", "is required"));
            None
        },
    };

    // No default: a row without an explicit active flag is invalid.
    let active = match present(map, "active") {
        Some(v) => match coerce::coerce_bool(v) {
            Some(b) => Some(b),
            None => {
                errors.push(FieldError::new("active", "must be a boolean").with_value(v));
                None
            },
        },
        None => {
            errors.push(FieldError::new("active", "is required"));
            None
        },
    };

    let id = optional_uuid(map, "id", &mut errors);
    let created_at = optional_datetime(map, "created_at", &mut errors);
    let updated_at = optional_datetime(map, "updated_at", &mut errors);

    match (email, name, role, active) {
        (Some(email), Some(name), Some(role), Some(active)) if errors.is_empty() => {
            Ok(NormalizedUser {
                id,
                email,
                name,
                role,
                active,
                created_at,
                updated_at,
            })
        },
        _ => Err(errors),
    }
}

pub(crate) fn optional_uuid(
    map: &Map<String, Value>,
    field: &str,
    errors: &mut Vec<FieldError>,
) -> Option<Uuid> {
    let v = present(map, field)?;
    match coerce::coerce_uuid(v) {
        Some(id) => Some(id),
        None => {
            errors.push(FieldError::new(field, "must be a valid UUID").with_value(v));
            None
        },
    }
}

pub(crate) fn optional_datetime(
    map: &Map<String, Value>,
    field: &str,
    errors: &mut Vec<FieldError>,
) -> Option<DateTime<Utc>> {
    let v = present(map, field)?;
    match coerce::coerce_datetime(v) {
        Some(dt) => Some(dt),
        None => {
            errors.push(
                FieldError::new(field, "must be an ISO-8601 date-time").with_value(v),
            );
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
            "email": "Alice@Example.com",
            "name": " Alice ",
            "role": "Admin",
            "active": "true"
        })
    }

    fn as_map(v: &Value) -> &Map<String, Value> {
        v.as_object().unwrap()
    }

    #[test]
    fn test_valid_user_normalizes() {
        let user = validate_user(as_map(&valid_row())).unwrap();
        assert_eq!(user.email, "alice@example.com");
        assert_eq!(user.name, "Alice");
        assert_eq!(user.role, UserRole::Admin);
        assert!(user.active);
        assert!(user.id.is_none());
    }

    #[test]
    fn test_missing_email() {
        let row = json!({"name": "A", "role": "admin", "active": true});
        let errors = validate_user(as_map(&row)).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "email"));
    }

    #[test]
    fn test_bad_email_shape() {
        for email in ["no-at-sign", "user@nodot", "sp ace@example.com", "user@"] {
            let mut row = valid_row();
            row["email"] = json!(email);
            let errors = validate_user(as_map(&row)).unwrap_err();
            assert!(errors.iter().any(|e| e.field == "email"), "{email}");
        }
    }

    #[test]
    fn test_unknown_role() {
        let mut row = valid_row();
        row["role"] = json!("bogus-role");
        let errors = validate_user(as_map(&row)).unwrap_err();
        let err = errors.iter().find(|e| e.field == "role").unwrap();
        assert_eq!(err.value.as_deref(), Some("bogus-role"));
    }

    #[test]
    fn test_active_has_no_default() {
        let row = json!({"email": "a@b.c", "name": "A", "role": "reader"});
        let errors = validate_user(as_map(&row)).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "active"));
    }

    #[test]
    fn test_active_coercions() {
        for (raw, expected) in [(json!("yes"), true), (json!(0), false), (json!("1"), true)] {
            let mut row = valid_row();
            row["active"] = raw;
            let user = validate_user(as_map(&row)).unwrap();
            assert_eq!(user.active, expected);
        }
    }

    #[test]
    fn test_all_errors_reported() {
        let row = json!({"email": "nope", "role": "nope"});
        let errors = validate_user(as_map(&row)).unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"email"));
        assert!(fields.contains(&"name"));
        assert!(fields.contains(&"role"));
        assert!(fields.contains(&"active"));
    }

    #[test]
    fn test_optional_id_and_timestamps() {
        let mut row = valid_row();
        let id = Uuid::new_v4();
        row["id"] = json!(id.to_string());
        row["created_at"] = json!("2024-06-01T12:00:00Z");
        let user = validate_user(as_map(&row)).unwrap();
        assert_eq!(user.id, Some(id));
        assert!(user.created_at.is_some());

        row["id"] = json!("not-a-uuid");
        let errors = validate_user(as_map(&row)).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "id"));
    }
}
