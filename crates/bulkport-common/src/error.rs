//! Error types shared across the bulkport workspace
//!
//! This module provides user-friendly error types with actionable messages
//! that help diagnose and resolve issues.

use thiserror::Error;

/// Result type alias for bulkport operations
pub type Result<T> = std::result::Result<T, BulkportError>;

/// Base error type for bulkport
///
/// All errors include contextual information to help operators understand
/// what went wrong and how to fix it.
#[derive(Error, Debug)]
pub enum BulkportError {
    /// File system operations failed (read, write, create directory, etc.)
    #[error("File operation failed: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("Failed to process JSON data: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration is missing or invalid
    #[error("Configuration error: {message}. {suggestion}")]
    Config { message: String, suggestion: String },

    /// Network request failed
    #[error("Network request to '{url}' failed: {reason}")]
    Network { url: String, reason: String },

    /// Database operation failed
    #[error("Database operation failed: {operation} - {reason}")]
    Database { operation: String, reason: String },

    /// Failed to parse input data
    #[error("Failed to parse {data_type}: {reason}")]
    Parse { data_type: String, reason: String },

    /// Unexpected error with details
    #[error("Unexpected error: {message}")]
    Unknown { message: String },
}

impl BulkportError {
    /// Create a configuration error with suggestion
    pub fn config(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a network error
    pub fn network(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Network {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Create a database error
    pub fn database(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Database {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a parse error
    pub fn parse(data_type: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Parse {
            data_type: data_type.into(),
            reason: reason.into(),
        }
    }

    /// Create an unknown error
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::Unknown {
            message: message.into(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_message() {
        let err = BulkportError::config("DATABASE_URL is empty", "Set DATABASE_URL in .env");
        assert_eq!(
            err.to_string(),
            "Configuration error: DATABASE_URL is empty. Set DATABASE_URL in .env"
        );
    }

    #[test]
    fn test_parse_error_message() {
        let err = BulkportError::parse("ndjson line", "unexpected end of input");
        assert!(err.to_string().contains("ndjson line"));
        assert!(err.to_string().contains("unexpected end of input"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: BulkportError = io.into();
        assert!(matches!(err, BulkportError::Io(_)));
    }
}
