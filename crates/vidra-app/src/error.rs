//! Startup error taxonomy for the application shell.

use thiserror::Error;

/// Result alias for application startup.
pub type AppResult<T> = std::result::Result<T, AppError>;

/// Errors that abort application startup.
#[derive(Debug, Error)]
pub enum AppError {
    /// A required environment variable is missing.
    #[error("missing required environment variable {name}")]
    MissingEnv {
        /// Name of the missing variable.
        name: &'static str,
    },
    /// Configuration loading or validation failed.
    #[error("configuration error")]
    Config(#[from] vidra_config::ConfigError),
    /// Logging could not be installed.
    #[error("telemetry initialisation failed")]
    Telemetry(#[source] anyhow::Error),
    /// The data layer could not be initialised.
    #[error("data layer error")]
    Data(#[from] vidra_data::DataError),
    /// The HTTP server failed to bind or serve.
    #[error("API server error")]
    Serve(#[from] std::io::Error),
}
