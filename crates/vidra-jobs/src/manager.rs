//! Job state machine and idempotent initiation.

use std::time::Duration;

use tracing::info;
use uuid::Uuid;
use vidra_data::{JobRecord, JobStore, NewJob, QueueName, QueueStore};
use vidra_events::{Event, EventBus, JobStatus};
use vidra_torrent::MagnetLink;

use crate::error::{JobError, Result};
use crate::messages::DownloadMessage;
use crate::registry::ActiveDownloads;

/// Whether the state machine permits a transition.
///
/// ```text
/// PENDING -> DOWNLOADING -> CONVERTING -> COMPLETED
///    |           |               |
///    |           +----> FAILED <-+
///    +--> CANCELLED (from PENDING or DOWNLOADING)
/// ```
#[must_use]
pub fn transition_allowed(from: &JobStatus, to: &JobStatus) -> bool {
    matches!(
        (from, to),
        (JobStatus::Pending, JobStatus::Downloading)
            | (JobStatus::Downloading, JobStatus::Converting)
            | (JobStatus::Converting, JobStatus::Completed)
            | (
                JobStatus::Downloading | JobStatus::Converting,
                JobStatus::Failed { .. }
            )
            | (
                JobStatus::Pending | JobStatus::Downloading,
                JobStatus::Cancelled
            )
    )
}

/// Fields supplied when a client initiates a download.
#[derive(Debug, Clone)]
pub struct InitiateRequest {
    /// Video the download is for (opaque, caller-supplied).
    pub video_id: Uuid,
    /// Torrent identifier (opaque, caller-supplied).
    pub torrent_id: Uuid,
    /// Initiating user.
    pub user_id: Uuid,
    /// Magnet URI to download.
    pub magnet_uri: String,
    /// Queue priority, 1..=10.
    pub priority: i16,
}

/// Coordinates job records, the download queue, and running sessions.
#[derive(Clone)]
pub struct JobManager {
    jobs: JobStore,
    queue: QueueStore,
    events: EventBus,
    registry: ActiveDownloads,
    download_ttl: Duration,
}

impl JobManager {
    /// Wire a manager over its collaborators.
    #[must_use]
    pub const fn new(
        jobs: JobStore,
        queue: QueueStore,
        events: EventBus,
        registry: ActiveDownloads,
        download_ttl: Duration,
    ) -> Self {
        Self {
            jobs,
            queue,
            events,
            registry,
            download_ttl,
        }
    }

    /// The job store, for read paths that bypass the manager.
    #[must_use]
    pub const fn jobs(&self) -> &JobStore {
        &self.jobs
    }

    /// Idempotently initiate a download: an existing non-terminal job for
    /// the `(video, user)` pair is returned as-is; otherwise a PENDING job
    /// is inserted and exactly one message is enqueued.
    ///
    /// Returns the job plus whether it was newly created.
    ///
    /// # Errors
    ///
    /// Rejects malformed magnet URIs; propagates persistence failures.
    pub async fn initiate(&self, request: InitiateRequest) -> Result<(JobRecord, bool)> {
        // validate the magnet up front so a garbage URI never reaches a queue
        MagnetLink::parse(&request.magnet_uri).map_err(|err| JobError::InvalidMagnet {
            reason: err.to_string(),
        })?;

        let new = NewJob {
            id: Uuid::new_v4(),
            video_id: request.video_id,
            torrent_id: request.torrent_id,
            user_id: request.user_id,
            magnet_uri: request.magnet_uri.clone(),
        };
        let (record, created) = self.jobs.insert_pending(&new).await?;
        if !created {
            info!(job_id = %record.id, "returning existing active job");
            return Ok((record, false));
        }

        let message = DownloadMessage {
            job_id: record.id,
            magnet_uri: request.magnet_uri,
            priority: request.priority,
        };
        let payload = serde_json::to_value(&message)?;
        self.queue
            .enqueue(
                QueueName::Download,
                &payload,
                request.priority,
                self.download_ttl,
            )
            .await?;

        self.events.publish(Event::JobCreated {
            job_id: record.id,
            video_id: record.video_id,
            user_id: record.user_id,
        });
        info!(job_id = %record.id, video_id = %record.video_id, "download job admitted");
        Ok((record, true))
    }

    /// Fetch a job by id.
    ///
    /// # Errors
    ///
    /// [`JobError::NotFound`] when the job does not exist.
    pub async fn fetch(&self, job_id: Uuid) -> Result<JobRecord> {
        self.jobs
            .fetch(job_id)
            .await?
            .ok_or(JobError::NotFound(job_id))
    }

    /// Apply a validated transition and publish the matching event.
    ///
    /// # Errors
    ///
    /// [`JobError::IllegalTransition`] when the state machine forbids the
    /// move; persistence failures otherwise.
    pub async fn transition(
        &self,
        job_id: Uuid,
        to: JobStatus,
        detail: Option<&str>,
    ) -> Result<JobRecord> {
        let current = self.fetch(job_id).await?;
        if !transition_allowed(&current.status, &to) {
            return Err(JobError::IllegalTransition {
                job_id,
                from: current.status.as_str(),
                to: to.as_str(),
            });
        }
        let record = self.jobs.transition(job_id, &to, detail).await?;

        match &record.status {
            JobStatus::Failed { message } => {
                self.events.publish(Event::JobFailed {
                    job_id,
                    message: message.clone(),
                });
            }
            JobStatus::Completed => {
                self.events.publish(Event::JobCompleted {
                    job_id,
                    file_path: record.file_path.clone().unwrap_or_default(),
                });
            }
            status => {
                self.events.publish(Event::JobStateChanged {
                    job_id,
                    status: status.clone(),
                });
            }
        }
        Ok(record)
    }

    /// Cancel a PENDING or DOWNLOADING job: the record moves to CANCELLED
    /// and any running engine session is signalled to stop, announce
    /// `stopped`, and delete its partials.
    ///
    /// # Errors
    ///
    /// [`JobError::IllegalTransition`] when the job is already terminal or
    /// converting.
    pub async fn cancel(&self, job_id: Uuid) -> Result<JobRecord> {
        let record = self
            .transition(job_id, JobStatus::Cancelled, Some("cancelled by user"))
            .await?;
        if self.registry.cancel(job_id) {
            info!(%job_id, "cancellation signalled to running session");
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed() -> JobStatus {
        JobStatus::Failed {
            message: "x".to_string(),
        }
    }

    #[test]
    fn happy_path_transitions_are_allowed() {
        assert!(transition_allowed(
            &JobStatus::Pending,
            &JobStatus::Downloading
        ));
        assert!(transition_allowed(
            &JobStatus::Downloading,
            &JobStatus::Converting
        ));
        assert!(transition_allowed(
            &JobStatus::Converting,
            &JobStatus::Completed
        ));
    }

    #[test]
    fn failure_is_reachable_from_active_states_only() {
        assert!(transition_allowed(&JobStatus::Downloading, &failed()));
        assert!(transition_allowed(&JobStatus::Converting, &failed()));
        assert!(!transition_allowed(&JobStatus::Pending, &failed()));
        assert!(!transition_allowed(&JobStatus::Completed, &failed()));
    }

    #[test]
    fn cancellation_is_limited_to_pending_and_downloading() {
        assert!(transition_allowed(
            &JobStatus::Pending,
            &JobStatus::Cancelled
        ));
        assert!(transition_allowed(
            &JobStatus::Downloading,
            &JobStatus::Cancelled
        ));
        assert!(!transition_allowed(
            &JobStatus::Converting,
            &JobStatus::Cancelled
        ));
        assert!(!transition_allowed(
            &JobStatus::Completed,
            &JobStatus::Cancelled
        ));
    }

    #[test]
    fn terminal_states_admit_nothing() {
        for terminal in [JobStatus::Completed, JobStatus::Cancelled, failed()] {
            for target in [
                JobStatus::Pending,
                JobStatus::Downloading,
                JobStatus::Converting,
                JobStatus::Completed,
                JobStatus::Cancelled,
                failed(),
            ] {
                assert!(
                    !transition_allowed(&terminal, &target),
                    "{} -> {} must be rejected",
                    terminal.as_str(),
                    target.as_str()
                );
            }
        }
    }

    #[test]
    fn skipping_states_is_rejected() {
        assert!(!transition_allowed(
            &JobStatus::Pending,
            &JobStatus::Converting
        ));
        assert!(!transition_allowed(
            &JobStatus::Pending,
            &JobStatus::Completed
        ));
        assert!(!transition_allowed(
            &JobStatus::Downloading,
            &JobStatus::Completed
        ));
    }
}
