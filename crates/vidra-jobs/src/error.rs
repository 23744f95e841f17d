//! Error types for job lifecycle operations.

use thiserror::Error;
use uuid::Uuid;
use vidra_data::DataError;

/// Result alias for job operations.
pub type Result<T> = std::result::Result<T, JobError>;

/// Errors raised by the job manager and workers.
#[derive(Debug, Error)]
pub enum JobError {
    /// The supplied magnet URI did not parse.
    #[error("invalid magnet URI: {reason}")]
    InvalidMagnet {
        /// What the parser stumbled over.
        reason: String,
    },
    /// The referenced job does not exist.
    #[error("job {0} not found")]
    NotFound(Uuid),
    /// The requested transition is not legal from the job's current status.
    #[error("job {job_id} is '{from}' and cannot move to '{to}'")]
    IllegalTransition {
        /// The job in question.
        job_id: Uuid,
        /// Current status label.
        from: &'static str,
        /// Requested status label.
        to: &'static str,
    },
    /// A queue message could not be encoded or decoded.
    #[error("queue message encoding failed")]
    Message(#[from] serde_json::Error),
    /// The persistence layer failed.
    #[error(transparent)]
    Data(#[from] DataError),
}
