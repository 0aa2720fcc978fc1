//! Service surface
//!
//! The operations the HTTP façade calls into: create/get import jobs
//! (idempotent on the caller's key), create/get export jobs (with presigned
//! URL refresh), and streaming download of a finished export. Routing,
//! parameter binding and authentication live in the façade; this module
//! owns the semantics.

use std::str::FromStr;
use std::sync::Arc;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::codec::FileFormat;
use crate::error::{JobError, JobResult};
use crate::export::DOWNLOAD_URL_TTL;
use crate::jobs::models::{ExportFilters, ExportJob, ImportJob, JobStatus, ResourceType};
use crate::jobs::queue::{ExportJobData, ImportJobData, JobData, JobQueue};
use crate::jobs::store::{JobStore, NewExportJob, NewImportJob};
use crate::storage::Storage;

static IDEMPOTENCY_KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_-]{1,255}$").unwrap_or_else(|e| panic!("idempotency regex: {e}"))
});

/// Request to create an import job.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateImportRequest {
    pub resource_type: ResourceType,
    /// Exactly one of `file_url` / `storage_key` must be set.
    pub file_url: Option<String>,
    pub storage_key: Option<String>,
    pub file_name: Option<String>,
    pub file_size: Option<i64>,
    /// Auto-detected from `file_name` when absent.
    pub file_format: Option<FileFormat>,
    pub idempotency_key: Option<String>,
}

/// Request to create an export job.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateExportRequest {
    pub resource_type: ResourceType,
    pub format: FileFormat,
    pub filters: Option<ExportFilters>,
    pub fields: Option<Vec<String>>,
}

/// A finished export ready to pipe to the client.
pub struct ExportStream {
    pub stream: Box<dyn tokio::io::AsyncBufRead + Send + Unpin>,
    pub content_type: &'static str,
    pub suggested_filename: String,
}

pub struct JobService {
    store: JobStore,
    storage: Storage,
    queue: Arc<dyn JobQueue>,
    max_file_size_bytes: u64,
}

impl JobService {
    pub fn new(
        store: JobStore,
        storage: Storage,
        queue: Arc<dyn JobQueue>,
        max_file_size_bytes: u64,
    ) -> Self {
        Self {
            store,
            storage,
            queue,
            max_file_size_bytes,
        }
    }

    // ------------------------------------------------------------------
    // Imports
    // ------------------------------------------------------------------

    /// Create an import job and enqueue it.
    ///
    /// When the idempotency key matches an existing job the stored record
    /// comes back unchanged and nothing new is enqueued.
    #[instrument(skip(self, request))]
    pub async fn create_import_job(&self, request: CreateImportRequest) -> JobResult<ImportJob> {
        if let Some(key) = &request.idempotency_key {
            if !IDEMPOTENCY_KEY_RE.is_match(key) {
                return Err(JobError::invalid(
                    "idempotency key must be 1-255 characters of [A-Za-z0-9_-]",
                ));
            }
            if let Some(existing) = self.store.find_import_by_idempotency_key(key).await? {
                info!(job_id = %existing.id, "idempotency key matched, returning existing job");
                return Ok(existing);
            }
        }

        if request.file_url.is_none() && request.storage_key.is_none() {
            return Err(JobError::invalid(
                "either file_url or storage_key is required",
            ));
        }
        if let Some(size) = request.file_size {
            if size < 0 || size as u64 > self.max_file_size_bytes {
                return Err(JobError::invalid(format!(
                    "file size {} exceeds the {} byte limit",
                    size, self.max_file_size_bytes
                )));
            }
        }

        let file_format = match request.file_format {
            Some(format) => format,
            None => request
                .file_name
                .as_deref()
                .and_then(FileFormat::from_filename)
                .ok_or_else(|| {
                    JobError::invalid(
                        "file_format not given and not deducible from the file name",
                    )
                })?,
        };

        let new = NewImportJob {
            id: Uuid::new_v4(),
            idempotency_key: request.idempotency_key.clone(),
            resource_type: request.resource_type,
            file_url: request.file_url,
            storage_key: request.storage_key,
            file_name: request.file_name,
            file_size: request.file_size,
            file_format,
        };

        let job = match self.store.create_import(new).await {
            Ok(job) => job,
            // Two concurrent submissions with the same key: the partial
            // unique index decides, the loser returns the winner's record.
            Err(JobError::Database(e)) if is_unique_violation(&e, "idempotency_key") => {
                let key = request.idempotency_key.as_deref().unwrap_or_default();
                warn!(key, "idempotency race lost, returning existing job");
                return self
                    .store
                    .find_import_by_idempotency_key(key)
                    .await?
                    .ok_or(JobError::Database(e));
            },
            Err(e) => return Err(e),
        };

        self.queue
            .enqueue(JobData::Import(ImportJobData {
                job_id: job.id,
                resource_type: job.resource_type,
                file_url: job.file_url.clone(),
                storage_key: job.storage_key.clone(),
                file_format: job.file_format,
                idempotency_key: job.idempotency_key.clone(),
            }))
            .await
            .map_err(|e| JobError::internal(format!("enqueue import job: {}", e)))?;

        info!(job_id = %job.id, resource_type = %job.resource_type, "import job created");
        Ok(job)
    }

    pub async fn get_import_job(&self, id: Uuid) -> JobResult<ImportJob> {
        self.store
            .find_import(id)
            .await?
            .ok_or(JobError::NotFound(id))
    }

    pub async fn cancel_import_job(&self, id: Uuid) -> JobResult<ImportJob> {
        self.store.cancel_import(id).await
    }

    // ------------------------------------------------------------------
    // Exports
    // ------------------------------------------------------------------

    #[instrument(skip(self, request))]
    pub async fn create_export_job(&self, request: CreateExportRequest) -> JobResult<ExportJob> {
        if let Some(fields) = &request.fields {
            if fields.is_empty() {
                return Err(JobError::invalid("fields projection must not be empty"));
            }
        }

        let new = NewExportJob {
            id: Uuid::new_v4(),
            resource_type: request.resource_type,
            format: request.format,
            filters: request.filters,
            fields: request.fields,
        };
        let job = self.store.create_export(new).await?;

        self.queue
            .enqueue(JobData::Export(ExportJobData {
                job_id: job.id,
                resource_type: job.resource_type,
                format: job.format,
                filters: job.filters.clone().map(|f| f.0),
                fields: job.fields.clone().map(|f| f.0),
            }))
            .await
            .map_err(|e| JobError::internal(format!("enqueue export job: {}", e)))?;

        info!(job_id = %job.id, resource_type = %job.resource_type, "export job created");
        Ok(job)
    }

    /// Fetch an export job, refreshing a completed job's download URL when
    /// it has less than an hour of validity left.
    pub async fn get_export_job(&self, id: Uuid) -> JobResult<ExportJob> {
        let job = self
            .store
            .find_export(id)
            .await?
            .ok_or(JobError::NotFound(id))?;

        if job.status != JobStatus::Completed {
            return Ok(job);
        }
        let Some(storage_key) = job.storage_key.clone() else {
            return Ok(job);
        };
        if !needs_refresh(job.expires_at, Utc::now()) {
            return Ok(job);
        }

        let download_url = self
            .storage
            .presign_get(&storage_key, DOWNLOAD_URL_TTL)
            .await
            .map_err(|e| JobError::storage(e.to_string()))?;
        let expires_at = Utc::now()
            + chrono::Duration::from_std(DOWNLOAD_URL_TTL)
                .unwrap_or_else(|_| chrono::Duration::hours(24));
        self.store
            .refresh_export_download(id, &download_url, expires_at)
            .await?;

        let mut job = job;
        job.download_url = Some(download_url);
        job.expires_at = Some(expires_at);
        Ok(job)
    }

    pub async fn cancel_export_job(&self, id: Uuid) -> JobResult<ExportJob> {
        self.store.cancel_export(id).await
    }

    /// Stream a finished export artifact; the façade pipes it to the client.
    pub async fn stream_export(&self, id: Uuid) -> JobResult<ExportStream> {
        let job = self
            .store
            .find_export(id)
            .await?
            .ok_or(JobError::NotFound(id))?;

        if job.status != JobStatus::Completed {
            return Err(JobError::invalid(format!(
                "export job is {}, only completed exports can be streamed",
                job.status
            )));
        }
        let storage_key = job
            .storage_key
            .as_deref()
            .ok_or_else(|| JobError::internal("completed export has no storage key"))?;

        let stream = self
            .storage
            .get_stream(storage_key)
            .await
            .map_err(|e| JobError::storage(e.to_string()))?;

        Ok(ExportStream {
            stream: Box::new(stream),
            content_type: job.format.content_type(),
            suggested_filename: job
                .file_name
                .clone()
                .unwrap_or_else(|| format!("export.{}", job.format.extension())),
        })
    }
}

/// A URL needs refreshing when it is missing, expired, or has less than an
/// hour of validity left.
fn needs_refresh(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match expires_at {
        Some(expires_at) => expires_at <= now + chrono::Duration::hours(1),
        None => true,
    }
}

fn is_unique_violation(e: &sqlx::Error, constraint_hint: &str) -> bool {
    match e {
        sqlx::Error::Database(db) => {
            db.code().as_deref() == Some("23505")
                && db
                    .constraint()
                    .map(|c| c.contains(constraint_hint))
                    .unwrap_or(true)
        },
        _ => false,
    }
}

// ----------------------------------------------------------------------
// Error response DTO
// ----------------------------------------------------------------------

/// Logical error shape the façade serializes to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub status_code: u16,
    pub error: String,
    pub message: ErrorMessage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// One message or several (e.g. every failing field of a bad request).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorMessage {
    One(String),
    Many(Vec<String>),
}

impl ErrorResponse {
    pub fn from_error(error: &JobError, path: impl Into<String>) -> Self {
        let (status_code, label) = match error {
            JobError::NotFound(_) => (404, "Not Found"),
            JobError::InvalidRequest(_) => (400, "Bad Request"),
            JobError::Transition(_) => (409, "Conflict"),
            JobError::Cancelled => (409, "Conflict"),
            _ => (500, "Internal Server Error"),
        };
        Self {
            status_code,
            error: label.to_string(),
            message: ErrorMessage::One(error.to_string()),
            details: None,
            timestamp: Utc::now(),
            path: path.into(),
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

/// Validate an idempotency key outside of a request (used by the façade's
/// header parsing).
pub fn is_valid_idempotency_key(key: &str) -> bool {
    IDEMPOTENCY_KEY_RE.is_match(key)
}

/// Parse a file format from an explicit string or fall back to the
/// filename extension.
pub fn resolve_file_format(
    explicit: Option<&str>,
    file_name: Option<&str>,
) -> Option<FileFormat> {
    match explicit {
        Some(s) => FileFormat::from_str(s).ok(),
        None => file_name.and_then(FileFormat::from_filename),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_idempotency_key_format() {
        assert!(is_valid_idempotency_key("k1"));
        assert!(is_valid_idempotency_key("A-b_3"));
        assert!(is_valid_idempotency_key(&"x".repeat(255)));

        assert!(!is_valid_idempotency_key(""));
        assert!(!is_valid_idempotency_key(&"x".repeat(256)));
        assert!(!is_valid_idempotency_key("has space"));
        assert!(!is_valid_idempotency_key("sneaky/slash"));
    }

    #[test]
    fn test_resolve_file_format() {
        assert_eq!(
            resolve_file_format(Some("ndjson"), None),
            Some(FileFormat::Ndjson)
        );
        assert_eq!(
            resolve_file_format(None, Some("dump.jsonl")),
            Some(FileFormat::Ndjson)
        );
        assert_eq!(
            resolve_file_format(None, Some("users.csv")),
            Some(FileFormat::Csv)
        );
        assert_eq!(resolve_file_format(None, Some("file.bin")), None);
        assert_eq!(resolve_file_format(Some("xml"), Some("a.csv")), None);
    }

    #[test]
    fn test_needs_refresh() {
        let now = Utc::now();
        assert!(needs_refresh(None, now));
        assert!(needs_refresh(Some(now - chrono::Duration::hours(1)), now));
        assert!(needs_refresh(Some(now + chrono::Duration::minutes(30)), now));
        assert!(!needs_refresh(Some(now + chrono::Duration::hours(12)), now));
    }

    #[test]
    fn test_error_response_mapping() {
        let err = JobError::NotFound(Uuid::nil());
        let resp = ErrorResponse::from_error(&err, "/api/imports/x");
        assert_eq!(resp.status_code, 404);
        assert_eq!(resp.error, "Not Found");
        assert_eq!(resp.path, "/api/imports/x");

        let err = JobError::invalid("bad format");
        let resp = ErrorResponse::from_error(&err, "/api/imports");
        assert_eq!(resp.status_code, 400);
    }

    #[test]
    fn test_error_message_serializes_untagged() {
        let many = ErrorMessage::Many(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(serde_json::to_string(&many).unwrap(), r#"["a","b"]"#);
        let one = ErrorMessage::One("a".to_string());
        assert_eq!(serde_json::to_string(&one).unwrap(), r#""a""#);
    }
}
