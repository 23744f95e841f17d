//! Worker pools consuming the durable download and conversion queues.
//!
//! Each worker processes one leased message at a time and acknowledges only
//! after the job record reflects the outcome, so a crash leads to redelivery
//! once the lease lapses. A redelivered message whose job is already mid
//! flight (DOWNLOADING/CONVERTING) marks the job FAILED: partial engine
//! state is not resumable and is discarded.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vidra_cache::CacheManager;
use vidra_data::{JobRecord, LeasedMessage, NewCachedVideo, ProgressUpdate, QueueName, QueueStore};
use vidra_events::{Event, EventBus, JobStatus};
use vidra_media::{MediaInfo, Transcoder};
use vidra_torrent::storage::StorageInfo;
use vidra_torrent::{
    DownloadOutcome, DownloadSession, EngineConfig, EngineError, MagnetLink, TorrentMetadata,
};

use crate::error::JobError;
use crate::manager::JobManager;
use crate::messages::{ConversionMessage, DownloadMessage};
use crate::registry::ActiveDownloads;

/// Tunables for the worker pools.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Workers consuming the download queue.
    pub download_workers: u32,
    /// Workers consuming the conversion queue.
    pub conversion_workers: u32,
    /// TTL applied to conversion messages this pool enqueues.
    pub conversion_ttl: Duration,
    /// Sleep between polls of an empty queue.
    pub poll_interval: Duration,
    /// Message lease; extended while a download is making progress.
    pub lease: Duration,
    /// Scratch root for in-progress downloads (`<temp>/<job_id>/...`).
    pub temp_path: PathBuf,
    /// Final root for completed downloads (`<videos>/<job_id>/...`).
    pub videos_path: PathBuf,
    /// Engine tunables shared by all download sessions.
    pub engine: EngineConfig,
}

/// The download and conversion worker pools.
#[derive(Clone)]
pub struct WorkerPool {
    manager: JobManager,
    queue: QueueStore,
    cache: CacheManager,
    events: EventBus,
    transcoder: Transcoder,
    registry: ActiveDownloads,
    settings: Arc<WorkerSettings>,
}

impl WorkerPool {
    /// Wire a pool over its collaborators.
    #[must_use]
    pub fn new(
        manager: JobManager,
        queue: QueueStore,
        cache: CacheManager,
        events: EventBus,
        transcoder: Transcoder,
        registry: ActiveDownloads,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            manager,
            queue,
            cache,
            events,
            transcoder,
            registry,
            settings: Arc::new(settings),
        }
    }

    /// Spawn every worker task; the handles run until aborted.
    #[must_use]
    pub fn spawn(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for index in 0..self.settings.download_workers {
            let pool = self.clone();
            handles.push(tokio::spawn(async move {
                pool.consume(QueueName::Download, index).await;
            }));
        }
        for index in 0..self.settings.conversion_workers {
            let pool = self.clone();
            handles.push(tokio::spawn(async move {
                pool.consume(QueueName::Conversion, index).await;
            }));
        }
        info!(
            download_workers = self.settings.download_workers,
            conversion_workers = self.settings.conversion_workers,
            "worker pools started"
        );
        handles
    }

    async fn consume(&self, queue: QueueName, index: u32) {
        debug!(queue = queue.as_str(), index, "worker loop started");
        loop {
            match self.queue.dequeue(queue, self.settings.lease).await {
                Ok(Some(message)) => match queue {
                    QueueName::Download => self.process_download(message).await,
                    QueueName::Conversion => self.process_conversion(message).await,
                },
                Ok(None) => tokio::time::sleep(self.settings.poll_interval).await,
                Err(err) => {
                    warn!(queue = queue.as_str(), error = %err, "queue poll failed");
                    tokio::time::sleep(self.settings.poll_interval).await;
                }
            }
        }
    }

    async fn ack(&self, message_id: i64) {
        if let Err(err) = self.queue.ack(message_id).await {
            warn!(message_id, error = %err, "failed to acknowledge queue message");
        }
    }

    async fn process_download(&self, leased: LeasedMessage) {
        let message: DownloadMessage = match serde_json::from_value(leased.payload.clone()) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "dropping undecodable download message");
                self.ack(leased.id).await;
                return;
            }
        };

        let job = match self.manager.jobs().fetch(message.job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!(job_id = %message.job_id, "download message for unknown job");
                self.ack(leased.id).await;
                return;
            }
            Err(err) => {
                // leave the lease to lapse and retry later
                warn!(error = %err, "failed to load job for download message");
                return;
            }
        };

        match &job.status {
            JobStatus::Pending => {}
            JobStatus::Downloading | JobStatus::Converting => {
                // redelivery after a worker crash: on-disk state is stale
                warn!(job_id = %job.id, status = job.status.as_str(), "redelivered mid-flight job; failing");
                let failed = JobStatus::Failed {
                    message: "worker crashed mid-job; partial state discarded".to_string(),
                };
                if let Err(err) = self
                    .manager
                    .transition(job.id, failed, Some("queue redelivery"))
                    .await
                {
                    warn!(job_id = %job.id, error = %err, "failed to mark redelivered job");
                }
                let _ = tokio::fs::remove_dir_all(self.settings.temp_path.join(job.id.to_string()))
                    .await;
                self.ack(leased.id).await;
                return;
            }
            _terminal => {
                self.ack(leased.id).await;
                return;
            }
        }

        if let Err(reason) = self.execute_download(&message, &job, leased.id).await {
            warn!(job_id = %job.id, reason, "download failed");
            let failed = JobStatus::Failed { message: reason };
            if let Err(err) = self.manager.transition(job.id, failed, None).await {
                warn!(job_id = %job.id, error = %err, "failed to record job failure");
            }
        }
        self.ack(leased.id).await;
    }

    /// Run one download to its Converting hand-off. Errors are user-facing
    /// failure messages; an `Ok` return covers completion *and* the
    /// cancelled/raced cases that need no failure record.
    async fn execute_download(
        &self,
        message: &DownloadMessage,
        job: &JobRecord,
        lease_id: i64,
    ) -> Result<(), String> {
        match self
            .manager
            .transition(job.id, JobStatus::Downloading, None)
            .await
        {
            Ok(_) => {}
            // lost a race against cancellation; nothing to do
            Err(JobError::IllegalTransition { .. }) => return Ok(()),
            Err(err) => return Err(err.to_string()),
        }

        let magnet =
            MagnetLink::parse(&message.magnet_uri).map_err(|err| err.to_string())?;
        let mut metadata = match &magnet.metadata_source {
            Some(source) => TorrentMetadata::fetch(source)
                .await
                .map_err(|err| format!("metadata fetch failed: {err}"))?,
            None => return Err(EngineError::NoMetadataSource.to_string()),
        };
        // magnet tracker hints supplement the metadata's own list
        for tracker in &magnet.trackers {
            if !metadata.trackers.contains(tracker) {
                metadata.trackers.push(tracker.clone());
            }
        }

        let temp_root = self.settings.temp_path.join(job.id.to_string());
        let dest_root = self.settings.videos_path.join(job.id.to_string());

        // record the scratch path of the primary file so the streaming layer
        // can serve the still-growing download
        let info = StorageInfo::new(&metadata);
        let scratch_primary = temp_root.join(&info.files[info.primary_index].path);
        if let Err(err) = self
            .manager
            .jobs()
            .set_file_path(job.id, &scratch_primary.to_string_lossy())
            .await
        {
            warn!(job_id = %job.id, error = %err, "failed to record scratch path");
        }

        let (session, handle) =
            DownloadSession::new(metadata, temp_root, dest_root, self.settings.engine.clone())
                .map_err(|err| err.to_string())?;
        let progress = handle.progress();
        self.registry.insert(job.id, handle);
        let forwarder = self.spawn_progress_forwarder(job.id, lease_id, progress);

        let outcome = session.run().await;
        self.registry.remove(job.id);
        forwarder.abort();

        match outcome {
            Ok(DownloadOutcome::Completed {
                primary_file,
                total_bytes,
                ..
            }) => {
                debug!(job_id = %job.id, total_bytes, "download finished; queueing conversion");
                let primary = primary_file.to_string_lossy().into_owned();
                self.manager
                    .jobs()
                    .set_file_path(job.id, &primary)
                    .await
                    .map_err(|err| err.to_string())?;
                self.manager
                    .transition(job.id, JobStatus::Converting, None)
                    .await
                    .map_err(|err| err.to_string())?;

                let conversion = ConversionMessage {
                    job_id: job.id,
                    input_path: primary,
                };
                let payload =
                    serde_json::to_value(&conversion).map_err(|err| err.to_string())?;
                self.queue
                    .enqueue(
                        QueueName::Conversion,
                        &payload,
                        message.priority,
                        self.settings.conversion_ttl,
                    )
                    .await
                    .map_err(|err| err.to_string())?;
                Ok(())
            }
            Ok(DownloadOutcome::Cancelled) => {
                // the manager moved the record to CANCELLED before signalling
                debug!(job_id = %job.id, "session ended after cancellation");
                Ok(())
            }
            Err(err) => Err(err.to_string()),
        }
    }

    /// Mirror engine progress into the job record and the event bus, and
    /// keep the queue lease alive while the download advances.
    fn spawn_progress_forwarder(
        &self,
        job_id: Uuid,
        lease_id: i64,
        mut progress: tokio::sync::watch::Receiver<vidra_torrent::ProgressSnapshot>,
    ) -> JoinHandle<()> {
        let jobs = self.manager.jobs().clone();
        let queue = self.queue.clone();
        let events = self.events.clone();
        let lease = self.settings.lease;
        tokio::spawn(async move {
            while progress.changed().await.is_ok() {
                let snapshot = progress.borrow().clone();
                let percent = if snapshot.total_bytes == 0 {
                    0.0
                } else {
                    snapshot.downloaded_bytes as f64 / snapshot.total_bytes as f64 * 100.0
                };
                let update = ProgressUpdate {
                    progress: percent,
                    downloaded_bytes: snapshot.downloaded_bytes,
                    total_bytes: snapshot.total_bytes,
                    download_speed_bps: snapshot.speed_bps,
                    eta_seconds: snapshot.eta_seconds,
                    peers: snapshot.connected_peers,
                    current_phase: Some(snapshot.phase.as_str().to_string()),
                    available_bytes: snapshot.primary_available_bytes,
                };
                if let Err(err) = jobs.update_progress(job_id, &update).await {
                    warn!(%job_id, error = %err, "failed to persist progress");
                }
                events.publish(Event::DownloadProgress {
                    job_id,
                    downloaded_bytes: snapshot.downloaded_bytes,
                    total_bytes: snapshot.total_bytes,
                    speed_bps: snapshot.speed_bps,
                    eta_seconds: snapshot.eta_seconds,
                    peers: snapshot.connected_peers,
                    phase: snapshot.phase.as_str().to_string(),
                });
                if let Err(err) = queue.extend_lease(lease_id, lease).await {
                    warn!(%job_id, error = %err, "failed to extend queue lease");
                }
            }
        })
    }

    async fn process_conversion(&self, leased: LeasedMessage) {
        let message: ConversionMessage = match serde_json::from_value(leased.payload.clone()) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "dropping undecodable conversion message");
                self.ack(leased.id).await;
                return;
            }
        };

        let job = match self.manager.jobs().fetch(message.job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!(job_id = %message.job_id, "conversion message for unknown job");
                self.ack(leased.id).await;
                return;
            }
            Err(err) => {
                warn!(error = %err, "failed to load job for conversion message");
                return;
            }
        };

        match &job.status {
            JobStatus::Converting => {}
            status => {
                // completed redeliveries and stale messages are dropped
                debug!(job_id = %job.id, status = status.as_str(), "ignoring conversion message");
                self.ack(leased.id).await;
                return;
            }
        }

        if let Err(reason) = self.execute_conversion(&message, &job).await {
            warn!(job_id = %job.id, reason, "conversion failed");
            let failed = JobStatus::Failed { message: reason };
            if let Err(err) = self.manager.transition(job.id, failed, None).await {
                warn!(job_id = %job.id, error = %err, "failed to record job failure");
            }
        }
        self.ack(leased.id).await;
    }

    async fn execute_conversion(
        &self,
        message: &ConversionMessage,
        job: &JobRecord,
    ) -> Result<(), String> {
        let input = PathBuf::from(&message.input_path);

        // a missing probe tool degrades to serving the original file
        let probed = match self.transcoder.probe(&input).await {
            Ok(info) => Some(info),
            Err(err) => {
                warn!(job_id = %job.id, error = %err, "probe failed; serving original file");
                None
            }
        };

        let (final_path, final_info) = match &probed {
            Some(info) if info.needs_conversion() => {
                let output = conversion_target(&input);
                let converted = self
                    .transcoder
                    .convert(&input, &output)
                    .await
                    .map_err(|err| err.to_string())?;
                if !converted {
                    return Err("media conversion failed".to_string());
                }
                if let Err(err) = tokio::fs::remove_file(&input).await {
                    warn!(job_id = %job.id, error = %err, "failed to remove pre-conversion file");
                }
                let info = self.transcoder.probe(&output).await.unwrap_or_default();
                (output, info)
            }
            Some(info) => (input, info.clone()),
            None => (input, MediaInfo::default()),
        };

        let file_size = tokio::fs::metadata(&final_path)
            .await
            .map_err(|err| format!("converted artifact missing: {err}"))?
            .len();

        let record = NewCachedVideo {
            id: Uuid::new_v4(),
            video_id: job.video_id,
            torrent_id: job.torrent_id,
            file_path: final_path.to_string_lossy().into_owned(),
            file_size,
            format: final_info
                .format
                .as_deref()
                .map(|format| format.split(',').next().unwrap_or(format).to_string()),
            codec: final_info.video_codec.clone(),
            resolution: final_info.resolution.clone(),
            duration_seconds: final_info.duration_seconds,
            bitrate: final_info.bitrate,
            // overwritten by the cache manager's TTL policy
            expires_at: chrono::Utc::now(),
        };
        self.cache.adopt(record).await.map_err(|err| err.to_string())?;

        self.manager
            .jobs()
            .set_file_path(job.id, &final_path.to_string_lossy())
            .await
            .map_err(|err| err.to_string())?;
        self.manager
            .transition(job.id, JobStatus::Completed, None)
            .await
            .map_err(|err| err.to_string())?;
        info!(job_id = %job.id, path = %final_path.display(), "artifact cached and job completed");
        Ok(())
    }
}

/// Output path for a conversion, never colliding with the input.
fn conversion_target(input: &std::path::Path) -> PathBuf {
    let candidate = input.with_extension("mp4");
    if candidate == input {
        input.with_extension("h264.mp4")
    } else {
        candidate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn conversion_target_avoids_collisions() {
        assert_eq!(
            conversion_target(Path::new("/v/j/feature.mkv")),
            PathBuf::from("/v/j/feature.mp4")
        );
        assert_eq!(
            conversion_target(Path::new("/v/j/feature.mp4")),
            PathBuf::from("/v/j/feature.h264.mp4")
        );
    }
}
