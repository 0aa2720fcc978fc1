//! Job queue interface
//!
//! The engine only assumes a FIFO transport with at-least-once delivery and
//! retry-with-backoff on failure; [`JobQueue`] is that contract. The
//! [`InProcessQueue`] is the transport used by the bundled worker binary and
//! the tests: a tokio channel drained by the worker pool.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::codec::FileFormat;

use super::models::{ExportFilters, ResourceType};

/// Delivery attempts before a job error is final for the transport.
pub const MAX_DELIVERY_ATTEMPTS: u32 = 3;

/// Base delay of the exponential retry backoff.
pub const RETRY_BASE_DELAY_SECS: u64 = 5;

/// Payload delivered to workers for one import job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportJobData {
    pub job_id: Uuid,
    pub resource_type: ResourceType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_key: Option<String>,
    pub file_format: FileFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

/// Payload delivered to workers for one export job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportJobData {
    pub job_id: Uuid,
    pub resource_type: ResourceType,
    pub format: FileFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<ExportFilters>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,
}

/// A queued unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobData {
    Import(ImportJobData),
    Export(ExportJobData),
}

impl JobData {
    pub fn job_id(&self) -> Uuid {
        match self {
            JobData::Import(d) => d.job_id,
            JobData::Export(d) => d.job_id,
        }
    }

    /// Distributed-lock key guarding this job.
    pub fn lock_key(&self) -> String {
        match self {
            JobData::Import(d) => format!("import-job:{}", d.job_id),
            JobData::Export(d) => format!("export-job:{}", d.job_id),
        }
    }
}

/// Transport the engine enqueues onto.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, data: JobData) -> anyhow::Result<()>;
}

/// One delivery off the in-process transport.
#[derive(Debug)]
pub struct Delivery {
    pub data: JobData,
    /// 1-based attempt counter.
    pub attempt: u32,
}

/// Channel-backed transport for single-process deployments and tests.
#[derive(Clone)]
pub struct InProcessQueue {
    tx: mpsc::Sender<Delivery>,
}

impl InProcessQueue {
    /// Create the queue and the receiver the worker pool drains.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Delivery>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Put a delivery back with its attempt counter advanced; used by the
    /// worker pool's retry path.
    pub async fn redeliver(&self, data: JobData, attempt: u32) -> anyhow::Result<()> {
        self.tx
            .send(Delivery { data, attempt })
            .await
            .map_err(|_| anyhow::anyhow!("job queue closed"))
    }
}

#[async_trait]
impl JobQueue for InProcessQueue {
    async fn enqueue(&self, data: JobData) -> anyhow::Result<()> {
        self.tx
            .send(Delivery { data, attempt: 1 })
            .await
            .map_err(|_| anyhow::anyhow!("job queue closed"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn import_data() -> JobData {
        JobData::Import(ImportJobData {
            job_id: Uuid::new_v4(),
            resource_type: ResourceType::Users,
            file_url: None,
            storage_key: Some("imports/2026-01-01/x/users.csv".to_string()),
            file_format: FileFormat::Csv,
            idempotency_key: Some("k1".to_string()),
        })
    }

    #[test]
    fn test_lock_keys() {
        let data = import_data();
        assert_eq!(data.lock_key(), format!("import-job:{}", data.job_id()));

        let export = JobData::Export(ExportJobData {
            job_id: Uuid::new_v4(),
            resource_type: ResourceType::Articles,
            format: FileFormat::Ndjson,
            filters: None,
            fields: None,
        });
        assert_eq!(export.lock_key(), format!("export-job:{}", export.job_id()));
    }

    #[test]
    fn test_job_data_round_trips_through_json() {
        let data = import_data();
        let raw = serde_json::to_string(&data).unwrap();
        assert!(raw.contains(r#""kind":"import""#));
        let back: JobData = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, data);
    }

    #[tokio::test]
    async fn test_in_process_queue_is_fifo() {
        let (queue, mut rx) = InProcessQueue::new(8);
        let first = import_data();
        let second = import_data();
        queue.enqueue(first.clone()).await.unwrap();
        queue.enqueue(second.clone()).await.unwrap();

        let d1 = rx.recv().await.unwrap();
        let d2 = rx.recv().await.unwrap();
        assert_eq!(d1.data.job_id(), first.job_id());
        assert_eq!(d1.attempt, 1);
        assert_eq!(d2.data.job_id(), second.job_id());
    }

    #[tokio::test]
    async fn test_redeliver_bumps_attempt() {
        let (queue, mut rx) = InProcessQueue::new(8);
        let data = import_data();
        queue.redeliver(data.clone(), 2).await.unwrap();
        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.attempt, 2);
        assert_eq!(delivery.data, data);
    }
}
