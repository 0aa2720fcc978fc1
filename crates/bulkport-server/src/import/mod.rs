//! Import job processing
//!
//! Drives one delivered import job end to end: take the distributed lock,
//! win the PENDING -> PROCESSING transition, stream the source through
//! decode -> validate -> upsert, then finalize. A second node delivering
//! the same job either fails the lock or loses the transition and exits
//! quietly, which is what makes duplicate queue deliveries harmless.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::TryStreamExt;
use tokio::io::{AsyncRead, BufReader};
use tracing::{info, instrument, warn};

use bulkport_lock::LockManager;

use crate::codec::{Batcher, CodecError, CountingReader, Decoder, ThroughputMeter};
use crate::config::WorkerConfig;
use crate::error::{JobError, JobResult};
use crate::jobs::models::{
    ImportJob, JobMetrics, JobStatus, ResourceType, RowError, MAX_STORED_ERRORS,
};
use crate::jobs::queue::ImportJobData;
use crate::jobs::store::{ImportOutcome, JobStore};
use crate::storage::Storage;
use crate::validate::{validate_record, FieldError, ValidRecord};

pub mod upsert;

pub use upsert::{BatchOutcome, RowItem, UpsertEngine};

/// Interval between throughput log lines.
const METER_INTERVAL: Duration = Duration::from_secs(5);

pub struct ImportProcessor {
    store: JobStore,
    upsert: UpsertEngine,
    storage: Storage,
    lock: LockManager,
    http: reqwest::Client,
    config: WorkerConfig,
    lock_ttl: Duration,
}

impl ImportProcessor {
    pub fn new(
        store: JobStore,
        upsert: UpsertEngine,
        storage: Storage,
        lock: LockManager,
        config: WorkerConfig,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            store,
            upsert,
            storage,
            lock,
            http: reqwest::Client::new(),
            config,
            lock_ttl,
        }
    }

    /// Handle one queue delivery.
    ///
    /// Returns `Ok` for every case that must not trigger a queue retry:
    /// lock held elsewhere, job already advanced, job cancelled. Pipeline
    /// failures finalize the job as FAILED and then propagate so the
    /// transport applies its retry policy.
    #[instrument(skip(self, data), fields(job_id = %data.job_id))]
    pub async fn process(&self, data: &ImportJobData) -> JobResult<()> {
        let key = format!("import-job:{}", data.job_id);
        let Some(lock) = self.lock.acquire(&key, self.lock_ttl, 0, Duration::ZERO).await? else {
            info!("import job locked by another node, skipping delivery");
            return Ok(());
        };

        let result = self.process_owned(data).await;

        if let Err(e) = self.lock.release(lock).await {
            warn!(error = %e, "import job lock release failed");
        }
        result
    }

    async fn process_owned(&self, data: &ImportJobData) -> JobResult<()> {
        let owner = self.lock.node_id().to_string();
        let job = match self
            .store
            .transition_import(
                data.job_id,
                JobStatus::Pending,
                JobStatus::Processing,
                Some(&owner),
            )
            .await
        {
            Ok(job) => job,
            Err(JobError::Transition(reason)) => {
                info!(%reason, "import job not claimable, skipping delivery");
                return Ok(());
            },
            Err(e) => return Err(e),
        };

        info!(resource_type = %job.resource_type, format = %job.file_format, "import started");

        let mut run = ImportRun::new();
        match self.run_pipeline(&job, &mut run).await {
            Ok(()) => {
                let outcome = run.into_outcome(None);
                info!(
                    total = outcome.total_rows,
                    successful = outcome.successful_rows,
                    failed = outcome.failed_rows,
                    "import completed"
                );
                self.store
                    .finalize_import(job.id, JobStatus::Completed, &owner, outcome)
                    .await?;
                Ok(())
            },
            Err(JobError::Cancelled) => {
                info!("import cancelled mid-run, leaving record as cancelled");
                Ok(())
            },
            Err(e) => {
                let outcome = run.into_outcome(Some(e.to_string()));
                self.store
                    .finalize_import(job.id, JobStatus::Failed, &owner, outcome)
                    .await?;
                // Propagate so the queue retries with backoff.
                Err(e)
            },
        }
    }

    async fn run_pipeline(&self, job: &ImportJob, run: &mut ImportRun) -> JobResult<()> {
        let reader = self.open_source(job, run).await?;
        let mut decoder = Decoder::open(job.file_format, reader)
            .await
            .map_err(fatal_codec)?;

        let mut batcher: Batcher<(i64, ValidRecord)> = Batcher::new(self.config.batch_size);
        let mut meter = ThroughputMeter::new(METER_INTERVAL, |report| {
            info!(
                rows = report.total_rows,
                rows_per_second = report.rows_per_second as u64,
                "import progress"
            );
        });
        let mut batches_done: usize = 0;

        while let Some(row) = decoder.next_row().await.map_err(fatal_codec)? {
            run.total += 1;
            match row.result {
                Err(message) => {
                    run.processed += 1;
                    run.failed += 1;
                    run.push_error(RowError::new(
                        row.line_number,
                        None,
                        format!("parse error: {}", message),
                    ));
                },
                Ok(value) => match validate_record(job.resource_type, &value) {
                    Ok(record) => {
                        if let Some(batch) = batcher.push((row.line_number, record)) {
                            self.flush_batch(job.resource_type, batch, run).await?;
                            meter.add(self.config.batch_size as u64);
                            batches_done += 1;
                            if batches_done % self.config.progress_flush_batches == 0 {
                                self.flush_progress(job, run).await?;
                            }
                        }
                    },
                    Err(field_errors) => {
                        run.processed += 1;
                        run.failed += 1;
                        run.push_field_errors(row.line_number, field_errors);
                    },
                },
            }
        }

        if let Some(batch) = batcher.flush() {
            meter.add(batch.len() as u64);
            self.flush_batch(job.resource_type, batch, run).await?;
        }
        meter.finish();

        Ok(())
    }

    async fn flush_batch(
        &self,
        resource_type: ResourceType,
        batch: Vec<(i64, ValidRecord)>,
        run: &mut ImportRun,
    ) -> JobResult<()> {
        let size = batch.len() as i64;
        let outcome = match resource_type {
            ResourceType::Users => {
                let items = batch
                    .into_iter()
                    .map(|(row, record)| match record {
                        ValidRecord::User(user) => RowItem { row, record: user },
                        _ => unreachable!("user job validated a non-user record"),
                    })
                    .collect();
                self.upsert.upsert_users(items).await?
            },
            ResourceType::Articles => {
                let items = batch
                    .into_iter()
                    .map(|(row, record)| match record {
                        ValidRecord::Article(article) => RowItem {
                            row,
                            record: article,
                        },
                        _ => unreachable!("article job validated a non-article record"),
                    })
                    .collect();
                self.upsert.upsert_articles(items).await?
            },
            ResourceType::Comments => {
                let items = batch
                    .into_iter()
                    .map(|(row, record)| match record {
                        ValidRecord::Comment(comment) => RowItem {
                            row,
                            record: comment,
                        },
                        _ => unreachable!("comment job validated a non-comment record"),
                    })
                    .collect();
                self.upsert.upsert_comments(items).await?
            },
        };

        run.processed += size;
        run.successful += outcome.successful;
        run.failed += outcome.failed;
        run.skipped += outcome.skipped;
        for error in outcome.errors {
            run.push_error(error);
        }
        Ok(())
    }

    /// Progress snapshot plus the best-effort cancellation check. Both ride
    /// the same flush cadence, every N batches.
    async fn flush_progress(&self, job: &ImportJob, run: &ImportRun) -> JobResult<()> {
        if let Some(current) = self.store.find_import(job.id).await? {
            if current.status == JobStatus::Cancelled {
                return Err(JobError::Cancelled);
            }
        }
        self.store
            .update_import_progress(
                job.id,
                run.total,
                run.processed,
                run.successful,
                run.failed,
                run.skipped,
                &run.errors,
            )
            .await?;
        Ok(())
    }

    /// Open the job's byte source: object storage by key, or a remote URL.
    async fn open_source(
        &self,
        job: &ImportJob,
        run: &mut ImportRun,
    ) -> JobResult<BufReader<CountingReader<Box<dyn AsyncRead + Send + Unpin>>>> {
        let source: Box<dyn AsyncRead + Send + Unpin> = if let Some(key) = &job.storage_key {
            let stream = self
                .storage
                .get_stream(key)
                .await
                .map_err(|e| JobError::storage(e.to_string()))?;
            Box::new(stream)
        } else if let Some(url) = &job.file_url {
            let response = self
                .http
                .get(url)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| JobError::storage(format!("fetch {}: {}", url, e)))?;
            let stream = response
                .bytes_stream()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
            Box::new(tokio_util::io::StreamReader::new(stream))
        } else {
            return Err(JobError::invalid(
                "import job has neither storage_key nor file_url",
            ));
        };

        let counting = CountingReader::new(source);
        run.bytes = Some(counting.counter());
        Ok(BufReader::new(counting))
    }
}

fn fatal_codec(e: CodecError) -> JobError {
    match e {
        CodecError::Io(io) => JobError::Io(io),
        CodecError::Fatal(message) => JobError::Decode(message),
    }
}

/// Mutable run state, kept outside the pipeline so a failing run still
/// finalizes with its partial counters and metrics.
struct ImportRun {
    total: i64,
    processed: i64,
    successful: i64,
    failed: i64,
    skipped: i64,
    errors: Vec<RowError>,
    dropped_errors: u64,
    started: Instant,
    bytes: Option<Arc<AtomicU64>>,
}

impl ImportRun {
    fn new() -> Self {
        Self {
            total: 0,
            processed: 0,
            successful: 0,
            failed: 0,
            skipped: 0,
            errors: Vec::new(),
            dropped_errors: 0,
            started: Instant::now(),
            bytes: None,
        }
    }

    /// Record an error, dropping past the storage cap (the counter already
    /// reflects the row).
    fn push_error(&mut self, error: RowError) {
        if self.errors.len() < MAX_STORED_ERRORS {
            self.errors.push(error);
        } else {
            self.dropped_errors += 1;
        }
    }

    fn push_field_errors(&mut self, row: i64, field_errors: Vec<FieldError>) {
        for fe in field_errors {
            let mut error = RowError::new(row, Some(fe.field), fe.message);
            if let Some(value) = fe.value {
                error = error.with_value(value);
            }
            self.push_error(error);
        }
    }

    fn into_outcome(self, error_message: Option<String>) -> ImportOutcome {
        let duration_ms = self.started.elapsed().as_millis() as i64;
        let metrics = JobMetrics {
            rows_per_second: if duration_ms > 0 {
                self.processed as f64 * 1000.0 / duration_ms as f64
            } else {
                0.0
            },
            duration_ms,
            error_rate: if self.processed > 0 {
                Some(self.failed as f64 / self.processed as f64)
            } else {
                None
            },
            total_bytes: self
                .bytes
                .map(|counter| counter.load(Ordering::Relaxed) as i64),
        };

        ImportOutcome {
            total_rows: self.total,
            processed_rows: self.processed,
            successful_rows: self.successful,
            failed_rows: self.failed,
            skipped_rows: self.skipped,
            errors: self.errors,
            metrics: Some(metrics),
            error_message,
        }
    }
}
