//! Wire DTOs for the HTTP API. JSON is camelCase throughout.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use vidra_data::{CacheStats, JobRecord, SubtitleRecord};
use vidra_events::JobStatus;

/// Body of `POST /streaming/download`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
    /// Video the download is for (opaque, caller-supplied).
    pub video_id: Uuid,
    /// Torrent identifier (opaque, caller-supplied).
    pub torrent_id: Uuid,
    /// Initiating user.
    pub user_id: Uuid,
    /// Magnet URI to download.
    pub magnet_link: String,
    /// Optional queue priority, 1..=10 (higher first).
    #[serde(default = "default_priority")]
    pub priority: i16,
}

const fn default_priority() -> i16 {
    5
}

/// Full job representation returned by the job endpoints.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadJobDto {
    /// Job identifier.
    pub id: Uuid,
    /// Video the job downloads an artifact for.
    pub video_id: Uuid,
    /// Torrent identifier.
    pub torrent_id: Uuid,
    /// Initiating user.
    pub user_id: Uuid,
    /// Lifecycle status label.
    pub status: String,
    /// Completion percentage, 0..=100.
    pub progress: f64,
    /// Verified payload bytes.
    pub downloaded_bytes: u64,
    /// Total payload bytes.
    pub total_bytes: u64,
    /// Smoothed download speed in bytes per second.
    pub download_speed: u64,
    /// Estimated seconds until completion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<u64>,
    /// Connected peer count.
    pub peers: u32,
    /// Engine phase label.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<String>,
    /// Artifact path, once known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    /// Failure detail, when the job failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// When the job was admitted.
    pub created_at: DateTime<Utc>,
    /// When a worker first picked the job up.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<JobRecord> for DownloadJobDto {
    fn from(record: JobRecord) -> Self {
        let (status, error_message) = split_status(&record.status);
        Self {
            id: record.id,
            video_id: record.video_id,
            torrent_id: record.torrent_id,
            user_id: record.user_id,
            status,
            progress: record.progress,
            downloaded_bytes: record.downloaded_bytes,
            total_bytes: record.total_bytes,
            download_speed: record.download_speed_bps,
            eta_seconds: record.eta_seconds,
            peers: record.peers,
            current_phase: record.current_phase,
            file_path: record.file_path,
            error_message,
            created_at: record.created_at,
            started_at: record.started_at,
            completed_at: record.completed_at,
        }
    }
}

/// Response of `GET /streaming/jobs/{id}/ready`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyDto {
    /// Job identifier.
    pub job_id: Uuid,
    /// Whether the artifact is ready to stream end-to-end.
    pub ready: bool,
    /// Lifecycle status label.
    pub status: String,
    /// Completion percentage, 0..=100.
    pub progress: f64,
    /// Artifact path, exposed once the job completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    /// Verified payload bytes.
    pub downloaded_bytes: u64,
    /// Total payload bytes.
    pub total_bytes: u64,
    /// Smoothed download speed in bytes per second.
    pub download_speed: u64,
    /// Estimated seconds until completion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<u64>,
    /// Connected peer count.
    pub peers: u32,
    /// Engine phase label.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<String>,
    /// Failure detail, when the job failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl From<JobRecord> for ReadyDto {
    fn from(record: JobRecord) -> Self {
        let ready = matches!(record.status, JobStatus::Completed);
        let (status, error_message) = split_status(&record.status);
        Self {
            job_id: record.id,
            ready,
            status,
            progress: record.progress,
            file_path: if ready { record.file_path } else { None },
            downloaded_bytes: record.downloaded_bytes,
            total_bytes: record.total_bytes,
            download_speed: record.download_speed_bps,
            eta_seconds: record.eta_seconds,
            peers: record.peers,
            current_phase: record.current_phase,
            error_message,
        }
    }
}

/// Subtitle listing entry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubtitleDto {
    /// Video the track belongs to.
    pub video_id: Uuid,
    /// ISO language code.
    pub language_code: String,
    /// Track format (`srt` or `vtt`).
    pub format: String,
    /// Free-text provenance.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl From<SubtitleRecord> for SubtitleDto {
    fn from(record: SubtitleRecord) -> Self {
        Self {
            video_id: record.video_id,
            language_code: record.language_code,
            format: record.format,
            source: record.source,
        }
    }
}

/// Response of `GET /streaming/cache/stats`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct CacheStatsDto {
    /// Number of cached artifacts.
    pub entry_count: u64,
    /// Sum of artifact sizes in bytes.
    pub total_bytes: u64,
    /// Configured size cap in bytes.
    pub capacity_bytes: u64,
}

impl CacheStatsDto {
    /// Combine store statistics with the configured cap.
    #[must_use]
    pub fn from_stats(stats: CacheStats, capacity_bytes: u64) -> Self {
        Self {
            entry_count: u64::try_from(stats.entry_count).unwrap_or_default(),
            total_bytes: u64::try_from(stats.total_bytes).unwrap_or_default(),
            capacity_bytes,
        }
    }
}

/// RFC 9457-style problem body for error responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemDetails {
    /// Stable machine-readable error kind.
    #[serde(rename = "type")]
    pub kind: String,
    /// Short human-readable title.
    pub title: String,
    /// HTTP status code.
    pub status: u16,
    /// Optional human-readable detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

fn split_status(status: &JobStatus) -> (String, Option<String>) {
    let error_message = match status {
        JobStatus::Failed { message } => Some(message.clone()),
        _ => None,
    };
    (status.as_str().to_string(), error_message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(status: JobStatus) -> JobRecord {
        JobRecord {
            id: Uuid::from_u128(1),
            video_id: Uuid::from_u128(2),
            torrent_id: Uuid::from_u128(3),
            user_id: Uuid::from_u128(4),
            status,
            progress: 42.5,
            downloaded_bytes: 425,
            total_bytes: 1_000,
            download_speed_bps: 64,
            eta_seconds: Some(9),
            peers: 7,
            current_phase: Some("DOWNLOADING".to_string()),
            available_bytes: 128,
            magnet_uri: "magnet:?xt=urn:btih:0".to_string(),
            file_path: Some("/tmp/x".to_string()),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn job_dto_serialises_camel_case() {
        let dto = DownloadJobDto::from(record(JobStatus::Downloading));
        let json = serde_json::to_value(&dto).unwrap();
        assert_eq!(json["status"], "downloading");
        assert!(json.get("downloadedBytes").is_some());
        assert!(json.get("downloadSpeed").is_some());
        assert!(json.get("errorMessage").is_none());
    }

    #[test]
    fn ready_is_true_only_for_completed_jobs() {
        let pending = ReadyDto::from(record(JobStatus::Pending));
        assert!(!pending.ready);
        assert!(pending.file_path.is_none(), "path hidden until completion");

        let done = ReadyDto::from(record(JobStatus::Completed));
        assert!(done.ready);
        assert_eq!(done.file_path.as_deref(), Some("/tmp/x"));
    }

    #[test]
    fn failed_jobs_expose_the_error_message() {
        let dto = DownloadJobDto::from(record(JobStatus::Failed {
            message: "no peers".to_string(),
        }));
        assert_eq!(dto.status, "failed");
        assert_eq!(dto.error_message.as_deref(), Some("no peers"));
    }

    #[test]
    fn download_request_applies_default_priority() {
        let request: DownloadRequest = serde_json::from_value(serde_json::json!({
            "videoId": Uuid::from_u128(1),
            "torrentId": Uuid::from_u128(2),
            "userId": Uuid::from_u128(3),
            "magnetLink": "magnet:?xt=urn:btih:00"
        }))
        .unwrap();
        assert_eq!(request.priority, 5);
    }
}
