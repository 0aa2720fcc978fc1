//! Job store
//!
//! Persistence for import and export job records, built around two critical
//! primitives: the atomic status transition and the finalize. Both run in a
//! SERIALIZABLE transaction with the job row selected FOR UPDATE, so two
//! nodes racing on the same delivery cannot both advance it.
//!
//! Non-transactional progress snapshots are deliberately weaker: they may
//! lose races, but `GREATEST()` keeps counters from rolling backward.

use chrono::{DateTime, Duration, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::codec::FileFormat;
use crate::error::{JobResult, TransitionError};

use super::models::{
    ExportFilters, ExportJob, ImportJob, JobMetrics, JobStatus, ResourceType, RowError,
    MAX_STORED_ERRORS,
};

/// Parameters for a new import job record.
#[derive(Debug, Clone)]
pub struct NewImportJob {
    pub id: Uuid,
    pub idempotency_key: Option<String>,
    pub resource_type: ResourceType,
    pub file_url: Option<String>,
    pub storage_key: Option<String>,
    pub file_name: Option<String>,
    pub file_size: Option<i64>,
    pub file_format: FileFormat,
}

/// Parameters for a new export job record.
#[derive(Debug, Clone)]
pub struct NewExportJob {
    pub id: Uuid,
    pub resource_type: ResourceType,
    pub format: FileFormat,
    pub filters: Option<ExportFilters>,
    pub fields: Option<Vec<String>>,
}

/// Terminal outcome of an import pipeline.
#[derive(Debug, Clone, Default)]
pub struct ImportOutcome {
    pub total_rows: i64,
    pub processed_rows: i64,
    pub successful_rows: i64,
    pub failed_rows: i64,
    pub skipped_rows: i64,
    pub errors: Vec<RowError>,
    pub metrics: Option<JobMetrics>,
    pub error_message: Option<String>,
}

/// Terminal outcome of an export pipeline.
#[derive(Debug, Clone, Default)]
pub struct ExportOutcome {
    pub total_rows: i64,
    pub exported_rows: i64,
    pub storage_key: Option<String>,
    pub download_url: Option<String>,
    pub file_name: Option<String>,
    pub file_size: Option<i64>,
    pub expires_at: Option<DateTime<Utc>>,
    pub metrics: Option<JobMetrics>,
    pub error_message: Option<String>,
}

#[derive(Clone)]
pub struct JobStore {
    pool: PgPool,
}

impl JobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // ------------------------------------------------------------------
    // Create / fetch
    // ------------------------------------------------------------------

    pub async fn create_import(&self, new: NewImportJob) -> JobResult<ImportJob> {
        let job = sqlx::query_as::<_, ImportJob>(
            r#"
            INSERT INTO import_jobs (
                id, idempotency_key, resource_type, status,
                file_url, storage_key, file_name, file_size, file_format,
                total_rows, processed_rows, successful_rows, failed_rows, skipped_rows,
                errors, version, created_at, updated_at
            )
            VALUES ($1, $2, $3, 'pending', $4, $5, $6, $7, $8,
                    0, 0, 0, 0, 0, '[]'::jsonb, 1, NOW(), NOW())
            RETURNING *
            "#,
        )
        .bind(new.id)
        .bind(&new.idempotency_key)
        .bind(new.resource_type)
        .bind(&new.file_url)
        .bind(&new.storage_key)
        .bind(&new.file_name)
        .bind(new.file_size)
        .bind(new.file_format)
        .fetch_one(&self.pool)
        .await?;

        Ok(job)
    }

    pub async fn create_export(&self, new: NewExportJob) -> JobResult<ExportJob> {
        let job = sqlx::query_as::<_, ExportJob>(
            r#"
            INSERT INTO export_jobs (
                id, resource_type, format, status, filters, fields,
                total_rows, exported_rows, version, created_at, updated_at
            )
            VALUES ($1, $2, $3, 'pending', $4, $5, 0, 0, 1, NOW(), NOW())
            RETURNING *
            "#,
        )
        .bind(new.id)
        .bind(new.resource_type)
        .bind(new.format)
        .bind(new.filters.map(Json))
        .bind(new.fields.map(Json))
        .fetch_one(&self.pool)
        .await?;

        Ok(job)
    }

    pub async fn find_import(&self, id: Uuid) -> JobResult<Option<ImportJob>> {
        let job = sqlx::query_as::<_, ImportJob>("SELECT * FROM import_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    pub async fn find_export(&self, id: Uuid) -> JobResult<Option<ExportJob>> {
        let job = sqlx::query_as::<_, ExportJob>("SELECT * FROM export_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    pub async fn find_import_by_idempotency_key(
        &self,
        key: &str,
    ) -> JobResult<Option<ImportJob>> {
        let job = sqlx::query_as::<_, ImportJob>(
            "SELECT * FROM import_jobs WHERE idempotency_key = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    pub async fn list_imports(&self, limit: i64, offset: i64) -> JobResult<Vec<ImportJob>> {
        let jobs = sqlx::query_as::<_, ImportJob>(
            "SELECT * FROM import_jobs ORDER BY created_at DESC LIMIT $1 OFFSET $2",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    pub async fn list_exports(&self, limit: i64, offset: i64) -> JobResult<Vec<ExportJob>> {
        let jobs = sqlx::query_as::<_, ExportJob>(
            "SELECT * FROM export_jobs ORDER BY created_at DESC LIMIT $1 OFFSET $2",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    // ------------------------------------------------------------------
    // Atomic status transition
    // ------------------------------------------------------------------

    /// Atomically move an import job from `from` to `to`.
    ///
    /// Exactly one of any number of concurrent callers succeeds; the others
    /// see [`TransitionError::WrongStatus`]. Moving into PROCESSING stamps
    /// `locked_by`/`locked_at`/`started_at`; moving into a terminal state
    /// clears ownership and stamps `completed_at`.
    #[instrument(skip(self))]
    pub async fn transition_import(
        &self,
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
        owner: Option<&str>,
    ) -> JobResult<ImportJob> {
        self.guard_lattice(from, to)?;
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;

        let current: Option<(JobStatus,)> =
            sqlx::query_as("SELECT status FROM import_jobs WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;

        let Some((status,)) = current else {
            tx.rollback().await?;
            return Err(TransitionError::NotFound(id).into());
        };
        if status != from {
            tx.rollback().await?;
            return Err(TransitionError::WrongStatus {
                actual: status.to_string(),
                expected: from.to_string(),
            }
            .into());
        }

        let job = if to == JobStatus::Processing {
            sqlx::query_as::<_, ImportJob>(
                r#"
                UPDATE import_jobs
                SET status = $2, locked_by = $3, locked_at = NOW(),
                    started_at = NOW(), version = version + 1, updated_at = NOW()
                WHERE id = $1
                RETURNING *
                "#,
            )
            .bind(id)
            .bind(to)
            .bind(owner)
            .fetch_one(&mut *tx)
            .await?
        } else {
            sqlx::query_as::<_, ImportJob>(
                r#"
                UPDATE import_jobs
                SET status = $2, locked_by = NULL, locked_at = NULL,
                    completed_at = CASE WHEN $3 THEN NOW() ELSE completed_at END,
                    version = version + 1, updated_at = NOW()
                WHERE id = $1
                RETURNING *
                "#,
            )
            .bind(id)
            .bind(to)
            .bind(to.is_terminal())
            .fetch_one(&mut *tx)
            .await?
        };

        tx.commit().await?;
        Ok(job)
    }

    /// Atomically move an export job from `from` to `to`. See
    /// [`Self::transition_import`].
    #[instrument(skip(self))]
    pub async fn transition_export(
        &self,
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
        owner: Option<&str>,
    ) -> JobResult<ExportJob> {
        self.guard_lattice(from, to)?;
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;

        let current: Option<(JobStatus,)> =
            sqlx::query_as("SELECT status FROM export_jobs WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;

        let Some((status,)) = current else {
            tx.rollback().await?;
            return Err(TransitionError::NotFound(id).into());
        };
        if status != from {
            tx.rollback().await?;
            return Err(TransitionError::WrongStatus {
                actual: status.to_string(),
                expected: from.to_string(),
            }
            .into());
        }

        let job = if to == JobStatus::Processing {
            sqlx::query_as::<_, ExportJob>(
                r#"
                UPDATE export_jobs
                SET status = $2, locked_by = $3, locked_at = NOW(),
                    started_at = NOW(), version = version + 1, updated_at = NOW()
                WHERE id = $1
                RETURNING *
                "#,
            )
            .bind(id)
            .bind(to)
            .bind(owner)
            .fetch_one(&mut *tx)
            .await?
        } else {
            sqlx::query_as::<_, ExportJob>(
                r#"
                UPDATE export_jobs
                SET status = $2, locked_by = NULL, locked_at = NULL,
                    completed_at = CASE WHEN $3 THEN NOW() ELSE completed_at END,
                    version = version + 1, updated_at = NOW()
                WHERE id = $1
                RETURNING *
                "#,
            )
            .bind(id)
            .bind(to)
            .bind(to.is_terminal())
            .fetch_one(&mut *tx)
            .await?
        };

        tx.commit().await?;
        Ok(job)
    }

    fn guard_lattice(&self, from: JobStatus, to: JobStatus) -> Result<(), TransitionError> {
        if from.can_transition_to(to) {
            Ok(())
        } else {
            Err(TransitionError::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            })
        }
    }

    // ------------------------------------------------------------------
    // Finalize
    // ------------------------------------------------------------------

    /// Write the terminal state of an import job.
    ///
    /// Refuses (warn + `None`) unless the job is still PROCESSING and owned
    /// by `owner`: that is how a node that lost its lock mid-run discovers
    /// it must not advance the record.
    #[instrument(skip(self, outcome))]
    pub async fn finalize_import(
        &self,
        id: Uuid,
        terminal: JobStatus,
        owner: &str,
        mut outcome: ImportOutcome,
    ) -> JobResult<Option<ImportJob>> {
        debug_assert!(terminal.is_terminal());
        outcome.errors.truncate(MAX_STORED_ERRORS);

        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;

        let current: Option<(JobStatus, Option<String>)> = sqlx::query_as(
            "SELECT status, locked_by FROM import_jobs WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((status, locked_by)) = current else {
            warn!(job_id = %id, "finalize: import job disappeared");
            tx.rollback().await?;
            return Ok(None);
        };
        if status != JobStatus::Processing || locked_by.as_deref() != Some(owner) {
            warn!(
                job_id = %id,
                status = %status,
                locked_by = ?locked_by,
                owner = %owner,
                "finalize skipped: job no longer ours"
            );
            tx.rollback().await?;
            return Ok(None);
        }

        let job = sqlx::query_as::<_, ImportJob>(
            r#"
            UPDATE import_jobs
            SET status = $2,
                total_rows = $3, processed_rows = $4, successful_rows = $5,
                failed_rows = $6, skipped_rows = $7,
                errors = $8, metrics = $9, error_message = $10,
                locked_by = NULL, locked_at = NULL,
                completed_at = NOW(), version = version + 1, updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(terminal)
        .bind(outcome.total_rows)
        .bind(outcome.processed_rows)
        .bind(outcome.successful_rows)
        .bind(outcome.failed_rows)
        .bind(outcome.skipped_rows)
        .bind(Json(outcome.errors))
        .bind(outcome.metrics.map(Json))
        .bind(&outcome.error_message)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(job))
    }

    /// Write the terminal state of an export job. Same discipline as
    /// [`Self::finalize_import`].
    #[instrument(skip(self, outcome))]
    pub async fn finalize_export(
        &self,
        id: Uuid,
        terminal: JobStatus,
        owner: &str,
        outcome: ExportOutcome,
    ) -> JobResult<Option<ExportJob>> {
        debug_assert!(terminal.is_terminal());

        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;

        let current: Option<(JobStatus, Option<String>)> = sqlx::query_as(
            "SELECT status, locked_by FROM export_jobs WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((status, locked_by)) = current else {
            warn!(job_id = %id, "finalize: export job disappeared");
            tx.rollback().await?;
            return Ok(None);
        };
        if status != JobStatus::Processing || locked_by.as_deref() != Some(owner) {
            warn!(
                job_id = %id,
                status = %status,
                locked_by = ?locked_by,
                owner = %owner,
                "finalize skipped: job no longer ours"
            );
            tx.rollback().await?;
            return Ok(None);
        }

        let job = sqlx::query_as::<_, ExportJob>(
            r#"
            UPDATE export_jobs
            SET status = $2,
                total_rows = $3, exported_rows = $4,
                storage_key = COALESCE($5, storage_key),
                download_url = $6, file_name = COALESCE($7, file_name),
                file_size = $8, expires_at = $9,
                metrics = $10, error_message = $11,
                locked_by = NULL, locked_at = NULL,
                completed_at = NOW(), version = version + 1, updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(terminal)
        .bind(outcome.total_rows)
        .bind(outcome.exported_rows)
        .bind(&outcome.storage_key)
        .bind(&outcome.download_url)
        .bind(&outcome.file_name)
        .bind(outcome.file_size)
        .bind(outcome.expires_at)
        .bind(outcome.metrics.map(Json))
        .bind(&outcome.error_message)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(job))
    }

    // ------------------------------------------------------------------
    // Progress snapshots
    // ------------------------------------------------------------------

    /// Non-transactional counter snapshot for an import job.
    ///
    /// May lose a race against a concurrent writer; `GREATEST()` guarantees
    /// counters never go backward regardless.
    pub async fn update_import_progress(
        &self,
        id: Uuid,
        total_rows: i64,
        processed_rows: i64,
        successful_rows: i64,
        failed_rows: i64,
        skipped_rows: i64,
        errors: &[RowError],
    ) -> JobResult<()> {
        let capped = &errors[..errors.len().min(MAX_STORED_ERRORS)];
        sqlx::query(
            r#"
            UPDATE import_jobs
            SET total_rows = GREATEST(total_rows, $2),
                processed_rows = GREATEST(processed_rows, $3),
                successful_rows = GREATEST(successful_rows, $4),
                failed_rows = GREATEST(failed_rows, $5),
                skipped_rows = GREATEST(skipped_rows, $6),
                errors = $7,
                version = version + 1, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(total_rows)
        .bind(processed_rows)
        .bind(successful_rows)
        .bind(failed_rows)
        .bind(skipped_rows)
        .bind(Json(capped.to_vec()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Non-transactional counter snapshot for an export job.
    pub async fn update_export_progress(
        &self,
        id: Uuid,
        total_rows: i64,
        exported_rows: i64,
    ) -> JobResult<()> {
        sqlx::query(
            r#"
            UPDATE export_jobs
            SET total_rows = GREATEST(total_rows, $2),
                exported_rows = GREATEST(exported_rows, $3),
                version = version + 1, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(total_rows)
        .bind(exported_rows)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Refresh the presigned download URL of a completed export.
    pub async fn refresh_export_download(
        &self,
        id: Uuid,
        download_url: &str,
        expires_at: DateTime<Utc>,
    ) -> JobResult<()> {
        sqlx::query(
            r#"
            UPDATE export_jobs
            SET download_url = $2, expires_at = $3,
                version = version + 1, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(download_url)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Stale-job queries
    // ------------------------------------------------------------------

    /// Import jobs that look abandoned: PROCESSING past the stale threshold,
    /// or still locked past the lock threshold without reaching a terminal
    /// state.
    pub async fn list_stale_imports(
        &self,
        stale_threshold: Duration,
        stale_lock_threshold: Duration,
    ) -> JobResult<Vec<ImportJob>> {
        let started_before = Utc::now() - stale_threshold;
        let locked_before = Utc::now() - stale_lock_threshold;
        let jobs = sqlx::query_as::<_, ImportJob>(
            r#"
            SELECT * FROM import_jobs
            WHERE (status = 'processing' AND started_at < $1)
               OR (locked_by IS NOT NULL AND locked_at < $2
                   AND status IN ('pending', 'processing'))
            "#,
        )
        .bind(started_before)
        .bind(locked_before)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    /// Export counterpart of [`Self::list_stale_imports`].
    pub async fn list_stale_exports(
        &self,
        stale_threshold: Duration,
        stale_lock_threshold: Duration,
    ) -> JobResult<Vec<ExportJob>> {
        let started_before = Utc::now() - stale_threshold;
        let locked_before = Utc::now() - stale_lock_threshold;
        let jobs = sqlx::query_as::<_, ExportJob>(
            r#"
            SELECT * FROM export_jobs
            WHERE (status = 'processing' AND started_at < $1)
               OR (locked_by IS NOT NULL AND locked_at < $2
                   AND status IN ('pending', 'processing'))
            "#,
        )
        .bind(started_before)
        .bind(locked_before)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    /// Reclaim one stale import job.
    ///
    /// With `restart` and the job still PROCESSING, ownership is cleared and
    /// the job goes back to PENDING for the queue to re-deliver. Otherwise a
    /// still-live (pending/processing) job is failed outright. Returns the
    /// status written, or `None` when the job moved on by itself.
    pub async fn reclaim_import(
        &self,
        id: Uuid,
        restart: bool,
        reason: &str,
    ) -> JobResult<Option<JobStatus>> {
        let mut tx = self.pool.begin().await?;
        let current: Option<(JobStatus,)> =
            sqlx::query_as("SELECT status FROM import_jobs WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;

        let Some((status,)) = current else {
            tx.rollback().await?;
            return Ok(None);
        };

        let written = if restart && status == JobStatus::Processing {
            sqlx::query(
                r#"
                UPDATE import_jobs
                SET status = 'pending', locked_by = NULL, locked_at = NULL,
                    started_at = NULL, error_message = $2,
                    version = version + 1, updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(id)
            .bind(reason)
            .execute(&mut *tx)
            .await?;
            Some(JobStatus::Pending)
        } else if matches!(status, JobStatus::Pending | JobStatus::Processing) {
            sqlx::query(
                r#"
                UPDATE import_jobs
                SET status = 'failed', locked_by = NULL, locked_at = NULL,
                    completed_at = NOW(), error_message = $2,
                    version = version + 1, updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(id)
            .bind(reason)
            .execute(&mut *tx)
            .await?;
            Some(JobStatus::Failed)
        } else {
            None
        };

        tx.commit().await?;
        Ok(written)
    }

    /// Reclaim one stale export job. See [`Self::reclaim_import`].
    pub async fn reclaim_export(
        &self,
        id: Uuid,
        restart: bool,
        reason: &str,
    ) -> JobResult<Option<JobStatus>> {
        let mut tx = self.pool.begin().await?;
        let current: Option<(JobStatus,)> =
            sqlx::query_as("SELECT status FROM export_jobs WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;

        let Some((status,)) = current else {
            tx.rollback().await?;
            return Ok(None);
        };

        let written = if restart && status == JobStatus::Processing {
            sqlx::query(
                r#"
                UPDATE export_jobs
                SET status = 'pending', locked_by = NULL, locked_at = NULL,
                    started_at = NULL, error_message = $2,
                    version = version + 1, updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(id)
            .bind(reason)
            .execute(&mut *tx)
            .await?;
            Some(JobStatus::Pending)
        } else if matches!(status, JobStatus::Pending | JobStatus::Processing) {
            sqlx::query(
                r#"
                UPDATE export_jobs
                SET status = 'failed', locked_by = NULL, locked_at = NULL,
                    completed_at = NOW(), error_message = $2,
                    version = version + 1, updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(id)
            .bind(reason)
            .execute(&mut *tx)
            .await?;
            Some(JobStatus::Failed)
        } else {
            None
        };

        tx.commit().await?;
        Ok(written)
    }

    /// Best-effort cancellation: PENDING or PROCESSING moves to CANCELLED.
    pub async fn cancel_import(&self, id: Uuid) -> JobResult<ImportJob> {
        match self
            .transition_import(id, JobStatus::Pending, JobStatus::Cancelled, None)
            .await
        {
            Err(crate::error::JobError::Transition(TransitionError::WrongStatus { .. })) => {
                self.transition_import(id, JobStatus::Processing, JobStatus::Cancelled, None)
                    .await
            },
            other => other,
        }
    }

    /// Best-effort cancellation for exports.
    pub async fn cancel_export(&self, id: Uuid) -> JobResult<ExportJob> {
        match self
            .transition_export(id, JobStatus::Pending, JobStatus::Cancelled, None)
            .await
        {
            Err(crate::error::JobError::Transition(TransitionError::WrongStatus { .. })) => {
                self.transition_export(id, JobStatus::Processing, JobStatus::Cancelled, None)
                    .await
            },
            other => other,
        }
    }
}
