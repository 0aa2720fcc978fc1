//! Worker pool
//!
//! N slots (default 2) drain the job queue in parallel; within one job,
//! processing is single-threaded end to end. A failing delivery is retried
//! with exponential backoff up to the attempt cap, matching the contract an
//! external transport would provide.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::export::ExportProcessor;
use crate::import::ImportProcessor;
use crate::jobs::queue::{
    Delivery, InProcessQueue, JobData, MAX_DELIVERY_ATTEMPTS, RETRY_BASE_DELAY_SECS,
};

pub struct WorkerPool {
    import: Arc<ImportProcessor>,
    export: Arc<ExportProcessor>,
    queue: InProcessQueue,
    slots: usize,
}

impl WorkerPool {
    pub fn new(
        import: Arc<ImportProcessor>,
        export: Arc<ExportProcessor>,
        queue: InProcessQueue,
        slots: usize,
    ) -> Self {
        Self {
            import,
            export,
            queue,
            slots: slots.max(1),
        }
    }

    /// Spawn the worker slots. They stop after finishing the in-flight job
    /// once `shutdown` flips or the queue closes.
    pub fn start(
        self,
        rx: mpsc::Receiver<Delivery>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let rx = Arc::new(Mutex::new(rx));
        (0..self.slots)
            .map(|slot| {
                let rx = rx.clone();
                let import = self.import.clone();
                let export = self.export.clone();
                let queue = self.queue.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    worker_loop(slot, rx, import, export, queue, shutdown).await;
                })
            })
            .collect()
    }
}

async fn worker_loop(
    slot: usize,
    rx: Arc<Mutex<mpsc::Receiver<Delivery>>>,
    import: Arc<ImportProcessor>,
    export: Arc<ExportProcessor>,
    queue: InProcessQueue,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(slot, "worker started");
    loop {
        let delivery = tokio::select! {
            _ = shutdown.changed() => break,
            delivery = async {
                let mut rx = rx.lock().await;
                rx.recv().await
            } => match delivery {
                Some(delivery) => delivery,
                None => break, // queue closed
            },
        };

        let job_id = delivery.data.job_id();
        let result = match &delivery.data {
            JobData::Import(data) => import.process(data).await,
            JobData::Export(data) => export.process(data).await,
        };

        if let Err(e) = result {
            if delivery.attempt < MAX_DELIVERY_ATTEMPTS {
                let next_attempt = delivery.attempt + 1;
                let delay = Duration::from_secs(
                    RETRY_BASE_DELAY_SECS * 2u64.pow(delivery.attempt - 1),
                );
                warn!(
                    slot,
                    %job_id,
                    attempt = delivery.attempt,
                    retry_in_secs = delay.as_secs(),
                    error = %e,
                    "job failed, scheduling retry"
                );
                let queue = queue.clone();
                let data = delivery.data;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Err(e) = queue.redeliver(data, next_attempt).await {
                        error!(%job_id, error = %e, "redelivery failed");
                    }
                });
            } else {
                error!(
                    slot,
                    %job_id,
                    attempts = delivery.attempt,
                    error = %e,
                    "job failed after final attempt"
                );
            }
        }
    }
    info!(slot, "worker stopped");
}
