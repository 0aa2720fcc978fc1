//! Bulkport job engine
//!
//! Asynchronous bulk import/export of record datasets (users, articles,
//! comments) against PostgreSQL, with artifacts in S3-compatible object
//! storage.
//!
//! # Overview
//!
//! - **Jobs**: durable import/export job records with an atomic status
//!   transition primitive, stale-job recovery and a queue contract
//! - **Codec**: bounded-memory CSV / NDJSON / JSON-array decoders and
//!   encoders plus batching and throughput transforms
//! - **Validate**: pure per-resource record validation producing normalized
//!   typed records
//! - **Import**: lock -> claim -> decode -> validate -> upsert pipeline with
//!   per-row savepoints
//! - **Export**: count -> paged query -> encode -> multipart upload -> presign
//! - **Service**: the operations the HTTP façade calls
//!
//! # Cluster model
//!
//! Any number of processes on any number of machines consume the same
//! queue. Per-job exclusivity is a distributed lease (`bulkport-lock`)
//! combined with the PENDING -> PROCESSING transition: the lease keeps
//! duplicate deliveries cheap, the transition makes them harmless.
//!
//! # Example
//!
//! ```no_run
//! use bulkport_server::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let pool = bulkport_server::db::connect(&config.database).await?;
//!     let storage = bulkport_server::storage::Storage::new(config.storage.clone()).await?;
//!     // wire processors, workers and the sweeper; see src/main.rs
//!     let _ = (pool, storage);
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod db;
pub mod error;
pub mod export;
pub mod import;
pub mod jobs;
pub mod service;
pub mod storage;
pub mod validate;
pub mod worker;

// Re-export commonly used types
pub use error::{JobError, JobResult, TransitionError};
pub use jobs::{ExportJob, ImportJob, JobStatus, ResourceType};
