#![forbid(unsafe_code)]
#![deny(
    unused_must_use,
    unreachable_pub,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]
#![allow(clippy::module_name_repetitions)]

//! Core event bus for the Vidra platform.
//!
//! The bus provides a typed event enum, sequential identifiers, and support for
//! replaying recent events when subscribers reconnect. Internally it uses
//! `tokio::broadcast` with a bounded buffer; when the channel overflows, the
//! oldest events are dropped, matching the desired backpressure behaviour.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::sync::broadcast::{Receiver, Sender};
use tracing::error;
use uuid::Uuid;

/// Identifier assigned to each event emitted by the platform.
pub type EventId = u64;

/// Default buffer size for the in-memory replay ring.
const DEFAULT_REPLAY_CAPACITY: usize = 1_024;

/// Lifecycle states of a download job.
///
/// `Completed`, `Failed` and `Cancelled` are terminal; everything else may
/// still transition. The progression is
/// `Pending -> Downloading -> Converting -> Completed`, with `Failed`
/// reachable from `Downloading`/`Converting` and `Cancelled` from
/// `Pending`/`Downloading`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Job has been recorded but no worker has picked it up yet.
    Pending,
    /// A worker is actively downloading payload data from the swarm.
    Downloading,
    /// Download finished; the artifact is being rewrapped for playback.
    Converting,
    /// The cached artifact is ready for streaming.
    Completed,
    /// The job failed with a recorded error message.
    Failed {
        /// Error detail describing why the job failed.
        message: String,
    },
    /// The job was cancelled by the user before completion.
    Cancelled,
}

impl JobStatus {
    /// Whether the status admits no further transitions.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed { .. } | Self::Cancelled)
    }

    /// Stable lowercase label used in storage and API payloads.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Converting => "converting",
            Self::Completed => "completed",
            Self::Failed { .. } => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Typed domain events surfaced across the system.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A download job was admitted into the queue.
    JobCreated {
        /// Identifier of the job that was created.
        job_id: Uuid,
        /// Video the job will produce an artifact for.
        video_id: Uuid,
        /// User who initiated the download.
        user_id: Uuid,
    },
    /// A job transitioned into a new lifecycle state.
    JobStateChanged {
        /// Identifier of the job whose state changed.
        job_id: Uuid,
        /// Updated state snapshot.
        status: JobStatus,
    },
    /// Periodic progress update emitted while a job is downloading.
    DownloadProgress {
        /// Identifier of the job being tracked.
        job_id: Uuid,
        /// Aggregate bytes downloaded so far.
        downloaded_bytes: u64,
        /// Total bytes expected for the payload.
        total_bytes: u64,
        /// Smoothed download speed in bytes per second.
        speed_bps: u64,
        /// Estimated seconds until completion, when computable.
        eta_seconds: Option<u64>,
        /// Number of connected peers contributing data.
        peers: u32,
        /// Human-readable description of the current engine phase.
        phase: String,
    },
    /// A job finished and its artifact was adopted by the cache.
    JobCompleted {
        /// Identifier of the completed job.
        job_id: Uuid,
        /// Absolute path of the playable artifact.
        file_path: String,
    },
    /// A job failed with an error message.
    JobFailed {
        /// Identifier of the failed job.
        job_id: Uuid,
        /// Human-readable failure description.
        message: String,
    },
    /// A cached artifact was recorded for a video.
    VideoCached {
        /// Video the artifact belongs to.
        video_id: Uuid,
        /// Torrent the artifact was downloaded from.
        torrent_id: Uuid,
        /// Size of the artifact in bytes.
        file_size: u64,
    },
    /// A cached artifact was removed by the sweeper.
    CacheEvicted {
        /// Video whose artifact was evicted.
        video_id: Uuid,
        /// Why the sweeper removed the record (`expired` or `capacity`).
        reason: String,
    },
    /// A subtitle track was stored for a video.
    SubtitleStored {
        /// Video the subtitle belongs to.
        video_id: Uuid,
        /// ISO language code of the track.
        language: String,
    },
}

impl Event {
    /// Machine-friendly discriminator for log lines and stream consumers.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::JobCreated { .. } => "job_created",
            Self::JobStateChanged { .. } => "job_state_changed",
            Self::DownloadProgress { .. } => "download_progress",
            Self::JobCompleted { .. } => "job_completed",
            Self::JobFailed { .. } => "job_failed",
            Self::VideoCached { .. } => "video_cached",
            Self::CacheEvicted { .. } => "cache_evicted",
            Self::SubtitleStored { .. } => "subtitle_stored",
        }
    }
}

/// Metadata wrapper around events. Each envelope tracks the event id and
/// emission timestamp.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct EventEnvelope {
    /// Monotonic identifier assigned to the wrapped event.
    pub id: EventId,
    /// Timestamp recording when the envelope was produced.
    pub timestamp: DateTime<Utc>,
    /// Wrapped event payload.
    pub event: Event,
}

/// Shared event bus built on top of `tokio::broadcast`.
#[derive(Clone)]
pub struct EventBus {
    sender: Sender<EventEnvelope>,
    buffer: Arc<Mutex<VecDeque<EventEnvelope>>>,
    next_id: Arc<AtomicU64>,
    replay_capacity: usize,
}

impl EventBus {
    /// Construct a new bus with the provided broadcast capacity.
    ///
    /// The broadcast channel uses the same capacity as the in-memory replay
    /// buffer, ensuring dropped events impact both structures consistently.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "event bus capacity must be positive");
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            buffer: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            next_id: Arc::new(AtomicU64::new(1)),
            replay_capacity: capacity,
        }
    }

    /// Construct a bus with the default in-memory buffer size.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_REPLAY_CAPACITY)
    }

    /// Publish a new event to the bus, assigning it a sequential identifier.
    pub fn publish(&self, event: Event) -> EventId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let envelope = EventEnvelope {
            id,
            timestamp: Utc::now(),
            event,
        };

        {
            let mut buffer = self.lock_buffer();
            if buffer.len() == self.replay_capacity {
                buffer.pop_front();
            }
            buffer.push_back(envelope.clone());
        }

        let _ = self.sender.send(envelope);
        id
    }

    /// Subscribe to the bus, replaying any buffered events newer than `since_id`.
    #[must_use]
    pub fn subscribe(&self, since_id: Option<EventId>) -> EventStream {
        let mut backlog = VecDeque::new();
        if let Some(since) = since_id {
            let buffer = self.lock_buffer();
            for item in buffer.iter() {
                if item.id > since {
                    backlog.push_back(item.clone());
                }
            }
        }

        let receiver = self.sender.subscribe();
        EventStream { backlog, receiver }
    }

    /// Return a snapshot of buffered events newer than the supplied identifier.
    ///
    /// This is useful for endpoints that need incremental views without
    /// establishing a long-lived subscription.
    #[must_use]
    pub fn backlog_since(&self, since_id: EventId) -> Vec<EventEnvelope> {
        let buffer = self.lock_buffer();
        buffer
            .iter()
            .filter(|item| item.id > since_id)
            .cloned()
            .collect()
    }

    /// Returns the last assigned identifier, if any events have been published.
    #[must_use]
    pub fn last_event_id(&self) -> Option<EventId> {
        let buffer = self.lock_buffer();
        buffer.back().map(|event| event.id)
    }

    fn lock_buffer(&self) -> MutexGuard<'_, VecDeque<EventEnvelope>> {
        match self.buffer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                error!("event buffer mutex poisoned; continuing with recovered guard");
                poisoned.into_inner()
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream wrapper that yields events either from the replay backlog or from the
/// live broadcast channel.
pub struct EventStream {
    backlog: VecDeque<EventEnvelope>,
    receiver: Receiver<EventEnvelope>,
}

impl EventStream {
    /// Receive the next event, respecting the replay backlog first.
    pub async fn next(&mut self) -> Option<EventEnvelope> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }

        match self.receiver.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(_)) => self.receiver.recv().await.ok(),
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    const RECV_TIMEOUT: Duration = Duration::from_secs(1);

    fn sample_progress_event(id: usize) -> Event {
        Event::DownloadProgress {
            job_id: Uuid::from_u128(id as u128 + 1),
            downloaded_bytes: (id * 1_000) as u64,
            total_bytes: 500_000,
            speed_bps: 4_096,
            eta_seconds: Some(30),
            peers: 8,
            phase: "DOWNLOADING".to_string(),
        }
    }

    #[test]
    fn job_status_terminality() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Downloading.is_terminal());
        assert!(!JobStatus::Converting.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(
            JobStatus::Failed {
                message: "boom".to_string()
            }
            .is_terminal()
        );
    }

    #[test]
    fn event_kinds_match_serde_tags() {
        let job_id = Uuid::new_v4();
        let event = Event::JobStateChanged {
            job_id,
            status: JobStatus::Downloading,
        };
        let json = serde_json::to_value(&event).expect("event serialises");
        assert_eq!(json["type"], event.kind());
    }

    #[tokio::test]
    async fn sequential_ids_and_replay() {
        let bus = EventBus::with_capacity(16);

        let mut last_id = 0;
        for i in 0..5 {
            last_id = bus.publish(sample_progress_event(i));
        }
        assert_eq!(last_id, 5);

        let mut stream = bus.subscribe(Some(2));
        let mut received = Vec::new();
        for _ in 0..3 {
            if let Some(event) = stream.next().await {
                received.push(event);
            }
        }

        assert_eq!(received.len(), 3);
        assert_eq!(received.first().unwrap().id, 3);
        assert_eq!(received.last().unwrap().id, 5);
    }

    #[tokio::test]
    async fn last_event_id_reflects_recent_publish() {
        let bus = EventBus::with_capacity(2);
        assert!(bus.last_event_id().is_none(), "no events published yet");
        let published = bus.publish(sample_progress_event(0));
        assert_eq!(bus.last_event_id(), Some(published));
    }

    #[tokio::test]
    async fn live_events_arrive_after_backlog() {
        let bus = EventBus::with_capacity(8);
        let _ = bus.publish(sample_progress_event(0));
        let mut stream = bus.subscribe(Some(0));

        let first = timeout(RECV_TIMEOUT, stream.next())
            .await
            .expect("stream stalled")
            .expect("stream closed");
        assert_eq!(first.id, 1);

        let _ = bus.publish(sample_progress_event(1));
        let second = timeout(RECV_TIMEOUT, stream.next())
            .await
            .expect("stream stalled")
            .expect("stream closed");
        assert_eq!(second.id, 2);
    }

    #[tokio::test]
    async fn stream_returns_none_after_sender_dropped() {
        let mut stream = {
            let bus = EventBus::with_capacity(1);
            let stream = bus.subscribe(None);
            drop(bus);
            stream
        };
        assert!(
            stream.next().await.is_none(),
            "closing the sender should end the stream"
        );
    }
}
