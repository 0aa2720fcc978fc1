//! Durable job records, their store, the queue contract and stale-job
//! recovery.

pub mod models;
pub mod queue;
pub mod recovery;
pub mod store;

pub use models::{
    ExportFilters, ExportJob, ImportJob, JobMetrics, JobStatus, ResourceType, RowError,
};
pub use queue::{Delivery, ExportJobData, ImportJobData, InProcessQueue, JobData, JobQueue};
pub use recovery::StaleJobSweeper;
pub use store::{ExportOutcome, ImportOutcome, JobStore, NewExportJob, NewImportJob};
