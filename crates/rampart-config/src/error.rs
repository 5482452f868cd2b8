//! Configuration errors.

use std::path::PathBuf;
use thiserror::Error;

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Error types for configuration loading and validation
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Reading a configuration file failed
    #[error("Failed to read config file {path}: {source}")]
    Io {
        /// File path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// A file did not parse
    #[error("Failed to parse {format} config: {message}")]
    Parse {
        /// File format
        format: &'static str,
        /// Parser message
        message: String,
    },

    /// The file extension names no known format
    #[error("Unsupported config format: {0}")]
    UnsupportedFormat(String),

    /// An environment override did not parse
    #[error("Invalid environment override {key}={value:?}: {message}")]
    Env {
        /// Variable name
        key: String,
        /// Raw value
        value: String,
        /// Parser message
        message: String,
    },

    /// The configuration is inconsistent
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

impl ConfigError {
    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

impl From<validator::ValidationErrors> for ConfigError {
    fn from(errors: validator::ValidationErrors) -> Self {
        Self::Validation(errors.to_string())
    }
}
