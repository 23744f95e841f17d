//! Error types for media operations.

use thiserror::Error;

/// Result alias for media operations.
pub type Result<T> = std::result::Result<T, MediaError>;

/// Errors raised by the media tooling.
#[derive(Debug, Error)]
pub enum MediaError {
    /// Launching or talking to an external tool failed.
    #[error("media tool IO failure")]
    Io(#[from] std::io::Error),
    /// ffprobe exited unsuccessfully.
    #[error("ffprobe exited with {status}")]
    ProbeFailed {
        /// The probe process exit status.
        status: std::process::ExitStatus,
    },
    /// ffprobe produced output we could not interpret.
    #[error("ffprobe output was not valid JSON")]
    ProbeOutput(#[from] serde_json::Error),
    /// The subtitle source was missing or empty.
    #[error("subtitle source is empty")]
    EmptySubtitleSource,
}
