//! Persistence for download jobs and their transition audit trail.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;
use vidra_events::JobStatus;

use crate::error::{DataError, Result, query};

/// Fields required to admit a new job.
#[derive(Debug, Clone)]
pub struct NewJob {
    /// Identifier for the new job row.
    pub id: Uuid,
    /// Video the job downloads an artifact for.
    pub video_id: Uuid,
    /// Torrent identifier supplied by the caller.
    pub torrent_id: Uuid,
    /// Initiating user.
    pub user_id: Uuid,
    /// Magnet URI the engine will resolve.
    pub magnet_uri: String,
}

/// Advisory progress fields that update freely within a status.
#[derive(Debug, Clone, Default)]
pub struct ProgressUpdate {
    /// Completion percentage, 0..=100.
    pub progress: f64,
    /// Verified payload bytes.
    pub downloaded_bytes: u64,
    /// Total payload bytes.
    pub total_bytes: u64,
    /// Smoothed download speed in bytes per second.
    pub download_speed_bps: u64,
    /// Estimated seconds until completion.
    pub eta_seconds: Option<u64>,
    /// Connected peer count.
    pub peers: u32,
    /// Engine phase label.
    pub current_phase: Option<String>,
    /// Contiguously available bytes of the primary media file.
    pub available_bytes: u64,
}

/// A download job row.
#[derive(Debug, Clone)]
pub struct JobRecord {
    /// Job identifier.
    pub id: Uuid,
    /// Video the job downloads an artifact for.
    pub video_id: Uuid,
    /// Torrent identifier supplied at initiation.
    pub torrent_id: Uuid,
    /// Initiating user.
    pub user_id: Uuid,
    /// Lifecycle status (failure message folded in).
    pub status: JobStatus,
    /// Completion percentage, 0..=100.
    pub progress: f64,
    /// Verified payload bytes.
    pub downloaded_bytes: u64,
    /// Total payload bytes, 0 until metadata is known.
    pub total_bytes: u64,
    /// Smoothed download speed in bytes per second.
    pub download_speed_bps: u64,
    /// Estimated seconds until completion.
    pub eta_seconds: Option<u64>,
    /// Connected peer count.
    pub peers: u32,
    /// Engine phase label.
    pub current_phase: Option<String>,
    /// Contiguously available bytes of the primary media file.
    pub available_bytes: u64,
    /// Magnet URI the job was initiated with.
    pub magnet_uri: String,
    /// Artifact path: scratch location while downloading, final location once
    /// completed.
    pub file_path: Option<String>,
    /// When the job row was created.
    pub created_at: DateTime<Utc>,
    /// When a worker first picked the job up.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, FromRow)]
struct JobRow {
    id: Uuid,
    video_id: Uuid,
    torrent_id: Uuid,
    user_id: Uuid,
    status: String,
    error_message: Option<String>,
    progress: f64,
    downloaded_bytes: i64,
    total_bytes: i64,
    download_speed_bps: i64,
    eta_seconds: Option<i64>,
    peers: i32,
    current_phase: Option<String>,
    available_bytes: i64,
    magnet_uri: String,
    file_path: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl From<JobRow> for JobRecord {
    fn from(row: JobRow) -> Self {
        Self {
            id: row.id,
            video_id: row.video_id,
            torrent_id: row.torrent_id,
            user_id: row.user_id,
            status: status_from_label(&row.status, row.error_message),
            progress: row.progress,
            downloaded_bytes: to_u64(row.downloaded_bytes),
            total_bytes: to_u64(row.total_bytes),
            download_speed_bps: to_u64(row.download_speed_bps),
            eta_seconds: row.eta_seconds.and_then(|eta| u64::try_from(eta).ok()),
            peers: u32::try_from(row.peers).unwrap_or_default(),
            current_phase: row.current_phase,
            available_bytes: to_u64(row.available_bytes),
            magnet_uri: row.magnet_uri,
            file_path: row.file_path,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        }
    }
}

const SELECT_COLUMNS: &str = r"
    SELECT id, video_id, torrent_id, user_id, status, error_message, progress,
           downloaded_bytes, total_bytes, download_speed_bps, eta_seconds,
           peers, current_phase, available_bytes, magnet_uri, file_path,
           created_at, started_at, completed_at
    FROM download_jobs
";

/// Database-backed repository for download jobs.
#[derive(Clone)]
pub struct JobStore {
    pool: PgPool,
}

impl JobStore {
    /// Wrap a connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a PENDING job unless a non-terminal job already exists for the
    /// `(video_id, user_id)` pair; returns the row plus whether it was newly
    /// created.
    ///
    /// # Errors
    ///
    /// Returns an error when the database operation fails.
    pub async fn insert_pending(&self, new: &NewJob) -> Result<(JobRecord, bool)> {
        for _ in 0..2 {
            let mut tx = self.pool.begin().await.map_err(query("jobs.insert.begin"))?;
            let inserted = sqlx::query_as::<_, JobRow>(
                r"
                INSERT INTO download_jobs (id, video_id, torrent_id, user_id, status, magnet_uri)
                VALUES ($1, $2, $3, $4, 'pending', $5)
                ON CONFLICT (video_id, user_id)
                    WHERE status IN ('pending', 'downloading', 'converting')
                    DO NOTHING
                RETURNING id, video_id, torrent_id, user_id, status, error_message, progress,
                          downloaded_bytes, total_bytes, download_speed_bps, eta_seconds,
                          peers, current_phase, available_bytes, magnet_uri, file_path,
                          created_at, started_at, completed_at
                ",
            )
            .bind(new.id)
            .bind(new.video_id)
            .bind(new.torrent_id)
            .bind(new.user_id)
            .bind(&new.magnet_uri)
            .fetch_optional(&mut *tx)
            .await
            .map_err(query("jobs.insert"))?;

            if let Some(row) = inserted {
                sqlx::query(
                    "INSERT INTO job_transitions (job_id, from_status, to_status) VALUES ($1, NULL, 'pending')",
                )
                .bind(row.id)
                .execute(&mut *tx)
                .await
                .map_err(query("jobs.insert.audit"))?;
                tx.commit().await.map_err(query("jobs.insert.commit"))?;
                return Ok((row.into(), true));
            }
            tx.commit().await.map_err(query("jobs.insert.commit"))?;

            if let Some(existing) = self.find_active(new.video_id, new.user_id).await? {
                return Ok((existing, false));
            }
            // the conflicting job terminated between the insert and the
            // lookup; try once more
        }
        Err(DataError::NotFound {
            operation: "jobs.insert.race",
        })
    }

    /// Fetch a job by id.
    ///
    /// # Errors
    ///
    /// Returns an error when the database operation fails.
    pub async fn fetch(&self, job_id: Uuid) -> Result<Option<JobRecord>> {
        let row = sqlx::query_as::<_, JobRow>(&format!("{SELECT_COLUMNS} WHERE id = $1"))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query("jobs.fetch"))?;
        Ok(row.map(Into::into))
    }

    /// The non-terminal job for a `(video, user)` pair, if any.
    ///
    /// # Errors
    ///
    /// Returns an error when the database operation fails.
    pub async fn find_active(&self, video_id: Uuid, user_id: Uuid) -> Result<Option<JobRecord>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "{SELECT_COLUMNS} WHERE video_id = $1 AND user_id = $2 AND status IN ('pending', 'downloading', 'converting')"
        ))
        .bind(video_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(query("jobs.find_active"))?;
        Ok(row.map(Into::into))
    }

    /// All jobs, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error when the database operation fails.
    pub async fn list_all(&self) -> Result<Vec<JobRecord>> {
        let rows =
            sqlx::query_as::<_, JobRow>(&format!("{SELECT_COLUMNS} ORDER BY created_at DESC"))
                .fetch_all(&self.pool)
                .await
                .map_err(query("jobs.list_all"))?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Jobs initiated by one user, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error when the database operation fails.
    pub async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<JobRecord>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "{SELECT_COLUMNS} WHERE user_id = $1 ORDER BY created_at DESC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(query("jobs.list_for_user"))?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Apply a status transition, appending it to the audit trail in the same
    /// transaction. Timestamps are maintained here: `started_at` on the first
    /// move to DOWNLOADING, `completed_at` on any terminal status.
    ///
    /// # Errors
    ///
    /// [`DataError::NotFound`] when the job does not exist; otherwise any
    /// database failure.
    pub async fn transition(
        &self,
        job_id: Uuid,
        to: &JobStatus,
        detail: Option<&str>,
    ) -> Result<JobRecord> {
        let (label, message) = status_label(to);
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(query("jobs.transition.begin"))?;

        let current: Option<(String,)> =
            sqlx::query_as("SELECT status FROM download_jobs WHERE id = $1 FOR UPDATE")
                .bind(job_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(query("jobs.transition.lock"))?;
        let Some((from_label,)) = current else {
            return Err(DataError::NotFound {
                operation: "jobs.transition",
            });
        };

        let updated = sqlx::query_as::<_, JobRow>(
            r"
            UPDATE download_jobs
            SET status = $2,
                error_message = $3,
                started_at = CASE
                    WHEN $2 = 'downloading' AND started_at IS NULL THEN now()
                    ELSE started_at
                END,
                completed_at = CASE
                    WHEN $2 IN ('completed', 'failed', 'cancelled') THEN now()
                    ELSE completed_at
                END
            WHERE id = $1
            RETURNING id, video_id, torrent_id, user_id, status, error_message, progress,
                      downloaded_bytes, total_bytes, download_speed_bps, eta_seconds,
                      peers, current_phase, available_bytes, magnet_uri, file_path,
                      created_at, started_at, completed_at
            ",
        )
        .bind(job_id)
        .bind(label)
        .bind(message.as_deref())
        .fetch_one(&mut *tx)
        .await
        .map_err(query("jobs.transition.update"))?;

        sqlx::query(
            "INSERT INTO job_transitions (job_id, from_status, to_status, detail) VALUES ($1, $2, $3, $4)",
        )
        .bind(job_id)
        .bind(&from_label)
        .bind(label)
        .bind(detail)
        .execute(&mut *tx)
        .await
        .map_err(query("jobs.transition.audit"))?;

        tx.commit().await.map_err(query("jobs.transition.commit"))?;
        Ok(updated.into())
    }

    /// Update advisory progress fields. A no-op once the job is terminal.
    ///
    /// # Errors
    ///
    /// Returns an error when the database operation fails.
    pub async fn update_progress(&self, job_id: Uuid, update: &ProgressUpdate) -> Result<()> {
        sqlx::query(
            r"
            UPDATE download_jobs
            SET progress = $2,
                downloaded_bytes = $3,
                total_bytes = $4,
                download_speed_bps = $5,
                eta_seconds = $6,
                peers = $7,
                current_phase = $8,
                available_bytes = $9
            WHERE id = $1 AND status NOT IN ('completed', 'failed', 'cancelled')
            ",
        )
        .bind(job_id)
        .bind(update.progress.clamp(0.0, 100.0))
        .bind(to_i64(update.downloaded_bytes))
        .bind(to_i64(update.total_bytes))
        .bind(to_i64(update.download_speed_bps))
        .bind(update.eta_seconds.map(to_i64))
        .bind(i32::try_from(update.peers).unwrap_or(i32::MAX))
        .bind(update.current_phase.as_deref())
        .bind(to_i64(update.available_bytes))
        .execute(&self.pool)
        .await
        .map_err(query("jobs.update_progress"))?;
        Ok(())
    }

    /// Record the artifact path for the job.
    ///
    /// # Errors
    ///
    /// Returns an error when the database operation fails.
    pub async fn set_file_path(&self, job_id: Uuid, file_path: &str) -> Result<()> {
        sqlx::query("UPDATE download_jobs SET file_path = $2 WHERE id = $1")
            .bind(job_id)
            .bind(file_path)
            .execute(&self.pool)
            .await
            .map_err(query("jobs.set_file_path"))?;
        Ok(())
    }
}

/// Stable storage label for a status, splitting out the failure message.
fn status_label(status: &JobStatus) -> (&'static str, Option<String>) {
    let message = match status {
        JobStatus::Failed { message } => Some(message.clone()),
        _ => None,
    };
    (status.as_str(), message)
}

/// Rehydrate a status from its storage label.
fn status_from_label(label: &str, message: Option<String>) -> JobStatus {
    match label {
        "pending" => JobStatus::Pending,
        "downloading" => JobStatus::Downloading,
        "converting" => JobStatus::Converting,
        "completed" => JobStatus::Completed,
        "failed" => JobStatus::Failed {
            message: message.unwrap_or_else(|| "unknown failure".to_string()),
        },
        "cancelled" => JobStatus::Cancelled,
        other => {
            tracing::warn!(status = %other, "unknown job status in store; treating as failed");
            JobStatus::Failed {
                message: format!("unknown stored status '{other}'"),
            }
        }
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_labels_round_trip() {
        let variants = [
            JobStatus::Pending,
            JobStatus::Downloading,
            JobStatus::Converting,
            JobStatus::Completed,
            JobStatus::Cancelled,
            JobStatus::Failed {
                message: "tracker drought".to_string(),
            },
        ];
        for status in variants {
            let (label, message) = status_label(&status);
            assert_eq!(status_from_label(label, message), status);
        }
    }

    #[test]
    fn unknown_label_degrades_to_failed() {
        let status = status_from_label("resurrecting", None);
        assert!(matches!(status, JobStatus::Failed { .. }));
    }

    #[test]
    fn clamps_preserve_reasonable_values() {
        assert_eq!(to_i64(42), 42);
        assert_eq!(to_i64(u64::MAX), i64::MAX);
        assert_eq!(to_u64(-5), 0);
        assert_eq!(to_u64(7), 7);
    }
}
