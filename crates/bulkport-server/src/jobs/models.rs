//! Job records and shared job-state types
//!
//! The durable job record is the source of truth for one bulk import or
//! export: status, ownership, counters, bounded row errors and final
//! metrics. All state changes flow through the [`super::store::JobStore`]
//! primitives.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use uuid::Uuid;

use crate::codec::FileFormat;

/// Hard cap on stored row errors per job; overflow still counts in
/// `failed_rows` but is not persisted.
pub const MAX_STORED_ERRORS: usize = 100;

/// Row-error values longer than this are truncated with an ellipsis.
pub const MAX_ERROR_VALUE_LENGTH: usize = 100;

/// The resource kinds this system can bulk-import and bulk-export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum ResourceType {
    Users,
    Articles,
    Comments,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Users => "users",
            ResourceType::Articles => "articles",
            ResourceType::Comments => "comments",
        }
    }

    /// Table holding the domain rows for this resource kind.
    pub fn table_name(&self) -> &'static str {
        self.as_str()
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResourceType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "users" => Ok(ResourceType::Users),
            "articles" => Ok(ResourceType::Articles),
            "comments" => Ok(ResourceType::Comments),
            _ => Err(anyhow::anyhow!("Invalid resource type: {}", s)),
        }
    }
}

/// Job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// The allowed transition lattice:
    /// `PENDING -> PROCESSING -> {COMPLETED, FAILED}`, plus cancellation
    /// from PENDING or PROCESSING. Everything else is rejected.
    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        matches!(
            (self, to),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Pending, JobStatus::Cancelled)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
                | (JobStatus::Processing, JobStatus::Cancelled)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded row failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowError {
    pub row: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl RowError {
    pub fn new(row: i64, field: Option<String>, message: impl Into<String>) -> Self {
        Self {
            row,
            field,
            message: message.into(),
            value: None,
        }
    }

    /// Attach the offending value, truncated to the storage limit.
    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(truncate_value(&value.into()));
        self
    }
}

/// Truncate long values with an ellipsis so the errors column stays small.
pub fn truncate_value(value: &str) -> String {
    if value.chars().count() <= MAX_ERROR_VALUE_LENGTH {
        value.to_string()
    } else {
        let mut out: String = value.chars().take(MAX_ERROR_VALUE_LENGTH).collect();
        out.push('…');
        out
    }
}

/// Metrics populated on finalize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct JobMetrics {
    pub rows_per_second: f64,
    pub duration_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<i64>,
}

/// Filters accepted by export jobs.
///
/// Unknown keys are ignored here; rejecting filters that do not apply to
/// the resource is the HTTP layer's business.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportFilters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<Uuid>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_after: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_before: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_after: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_before: Option<DateTime<Utc>>,
    /// users only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
    /// articles only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// articles only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author_id: Option<Uuid>,
    /// comments only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub article_id: Option<Uuid>,
    /// comments only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
}

/// Import job record (maps to the `import_jobs` table).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ImportJob {
    pub id: Uuid,
    pub idempotency_key: Option<String>,
    pub resource_type: ResourceType,
    pub status: JobStatus,
    pub file_url: Option<String>,
    pub storage_key: Option<String>,
    pub file_name: Option<String>,
    pub file_size: Option<i64>,
    pub file_format: FileFormat,
    pub total_rows: i64,
    pub processed_rows: i64,
    pub successful_rows: i64,
    pub failed_rows: i64,
    pub skipped_rows: i64,
    pub errors: Json<Vec<RowError>>,
    pub metrics: Option<Json<JobMetrics>>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Export job record (maps to the `export_jobs` table).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ExportJob {
    pub id: Uuid,
    pub resource_type: ResourceType,
    pub format: FileFormat,
    pub status: JobStatus,
    pub filters: Option<Json<ExportFilters>>,
    pub fields: Option<Json<Vec<String>>>,
    pub storage_key: Option<String>,
    pub download_url: Option<String>,
    pub file_name: Option<String>,
    pub file_size: Option<i64>,
    pub total_rows: i64,
    pub exported_rows: i64,
    pub metrics: Option<Json<JobMetrics>>,
    pub error_message: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ImportJob {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

impl ExportJob {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_status_lattice() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        assert!(Processing.can_transition_to(Cancelled));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Processing));
        assert!(!Failed.can_transition_to(Pending));
        assert!(!Cancelled.can_transition_to(Processing));
        assert!(!Processing.can_transition_to(Pending));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
    }

    #[test]
    fn test_resource_type_round_trip() {
        for (s, r) in [
            ("users", ResourceType::Users),
            ("articles", ResourceType::Articles),
            ("comments", ResourceType::Comments),
        ] {
            assert_eq!(s.parse::<ResourceType>().unwrap(), r);
            assert_eq!(r.to_string(), s);
        }
        assert!("tags".parse::<ResourceType>().is_err());
    }

    #[test]
    fn test_row_error_value_truncation() {
        let long = "x".repeat(150);
        let err = RowError::new(3, Some("email".to_string()), "too long").with_value(long);
        let stored = err.value.unwrap();
        assert_eq!(stored.chars().count(), MAX_ERROR_VALUE_LENGTH + 1);
        assert!(stored.ends_with('…'));

        let short = RowError::new(1, None, "m").with_value("ok");
        assert_eq!(short.value.as_deref(), Some("ok"));
    }

    #[test]
    fn test_export_filters_ignore_unknown_keys() {
        let raw = r#"{"active": true, "sort_by": "name"}"#;
        let filters: ExportFilters = serde_json::from_str(raw).unwrap();
        assert_eq!(filters.active, Some(true));
    }

    #[test]
    fn test_row_error_serialization_skips_empty_fields() {
        let err = RowError::new(2, None, "bad row");
        let json = serde_json::to_string(&err).unwrap();
        assert!(!json.contains("field"));
        assert!(!json.contains("value"));
    }
}
