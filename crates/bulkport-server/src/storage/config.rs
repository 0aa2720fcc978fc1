//! Object storage configuration

use serde::{Deserialize, Serialize};

/// Default bucket for job artifacts.
pub const DEFAULT_STORAGE_BUCKET: &str = "bulkport";

/// Default region (any S3-compatible endpoint accepts one).
pub const DEFAULT_STORAGE_REGION: &str = "us-east-1";

/// S3-compatible storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub bucket: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    /// Custom endpoint for MinIO or other S3-compatible stores.
    pub endpoint: Option<String>,
    /// Path-style addressing, required by MinIO.
    pub path_style: bool,
}

impl StorageConfig {
    /// Load from `STORAGE_*` environment variables.
    pub fn from_env() -> Self {
        Self {
            bucket: std::env::var("STORAGE_BUCKET")
                .unwrap_or_else(|_| DEFAULT_STORAGE_BUCKET.to_string()),
            region: std::env::var("STORAGE_REGION")
                .unwrap_or_else(|_| DEFAULT_STORAGE_REGION.to_string()),
            access_key: std::env::var("STORAGE_ACCESS_KEY").unwrap_or_default(),
            secret_key: std::env::var("STORAGE_SECRET_KEY").unwrap_or_default(),
            endpoint: std::env::var("STORAGE_ENDPOINT").ok(),
            path_style: std::env::var("STORAGE_PATH_STYLE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(true),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bucket: DEFAULT_STORAGE_BUCKET.to_string(),
            region: DEFAULT_STORAGE_REGION.to_string(),
            access_key: String::new(),
            secret_key: String::new(),
            endpoint: None,
            path_style: true,
        }
    }
}
