//! Error types for configuration operations.

use std::path::PathBuf;

use thiserror::Error;

/// Result alias for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Primary error type for configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read configuration file {path}")]
    Io {
        /// Path that failed to load.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
    /// The configuration file contained invalid JSON.
    #[error("failed to parse configuration file {path}")]
    Parse {
        /// Path that failed to parse.
        path: PathBuf,
        /// Underlying deserialisation error.
        #[source]
        source: serde_json::Error,
    },
    /// An environment override contained an unusable value.
    #[error("invalid environment override {name}")]
    InvalidOverride {
        /// Environment variable name.
        name: &'static str,
        /// Offending value.
        value: String,
    },
    /// Field contained an invalid value.
    #[error("invalid configuration field {section}.{field}: {reason}")]
    InvalidField {
        /// Section that failed validation.
        section: &'static str,
        /// Field that failed validation.
        field: &'static str,
        /// Machine-readable reason for the failure.
        reason: &'static str,
    },
}
