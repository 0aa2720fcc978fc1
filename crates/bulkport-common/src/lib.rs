//! Bulkport Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, utilities, and error handling for the bulkport workspace.
//!
//! # Overview
//!
//! This crate provides common functionality used across all workspace members:
//!
//! - **Error Handling**: the base error type shared by engine and lock crates
//! - **Logging**: tracing subscriber setup (console/file, text/JSON)
//! - **Coerce**: loosely-typed value coercion used by the record validators
//!
//! # Example
//!
//! ```no_run
//! use bulkport_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = LogConfig::from_env()?;
//!     init_logging(&config)?;
//!     tracing::info!("ready");
//!     Ok(())
//! }
//! ```

pub mod coerce;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{BulkportError, Result};
