//! Persistence for subtitle tracks.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::error::{Result, query};

/// Fields recorded when a subtitle track is stored.
#[derive(Debug, Clone)]
pub struct NewSubtitle {
    /// Identifier for the subtitle row.
    pub id: Uuid,
    /// Video the track belongs to.
    pub video_id: Uuid,
    /// ISO language code (e.g. `en`).
    pub language_code: String,
    /// Absolute path of the stored track.
    pub file_path: String,
    /// Track format (`srt` or `vtt`).
    pub format: String,
    /// Free-text provenance of the track.
    pub source: Option<String>,
}

/// A subtitle row.
#[derive(Debug, Clone, FromRow)]
pub struct SubtitleRecord {
    /// Identifier for the subtitle row.
    pub id: Uuid,
    /// Video the track belongs to.
    pub video_id: Uuid,
    /// ISO language code.
    pub language_code: String,
    /// Absolute path of the stored track.
    pub file_path: String,
    /// Track format (`srt` or `vtt`).
    pub format: String,
    /// Free-text provenance of the track.
    pub source: Option<String>,
    /// When the row was created.
    pub created_at: DateTime<Utc>,
}

/// Database-backed repository for subtitle tracks.
#[derive(Clone)]
pub struct SubtitleStore {
    pool: PgPool,
}

impl SubtitleStore {
    /// Wrap a connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record (or replace) the track for a `(video, language)` pair.
    ///
    /// # Errors
    ///
    /// Returns an error when the database operation fails.
    pub async fn upsert(&self, new: &NewSubtitle) -> Result<SubtitleRecord> {
        let record = sqlx::query_as::<_, SubtitleRecord>(
            r"
            INSERT INTO subtitles (id, video_id, language_code, file_path, format, source)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT ON CONSTRAINT subtitles_video_language DO UPDATE
            SET file_path = EXCLUDED.file_path,
                format = EXCLUDED.format,
                source = EXCLUDED.source
            RETURNING id, video_id, language_code, file_path, format, source, created_at
            ",
        )
        .bind(new.id)
        .bind(new.video_id)
        .bind(&new.language_code)
        .bind(&new.file_path)
        .bind(&new.format)
        .bind(new.source.as_deref())
        .fetch_one(&self.pool)
        .await
        .map_err(query("subtitles.upsert"))?;
        Ok(record)
    }

    /// All tracks recorded for a video.
    ///
    /// # Errors
    ///
    /// Returns an error when the database operation fails.
    pub async fn list_for_video(&self, video_id: Uuid) -> Result<Vec<SubtitleRecord>> {
        let records = sqlx::query_as::<_, SubtitleRecord>(
            r"
            SELECT id, video_id, language_code, file_path, format, source, created_at
            FROM subtitles
            WHERE video_id = $1
            ORDER BY language_code ASC
            ",
        )
        .bind(video_id)
        .fetch_all(&self.pool)
        .await
        .map_err(query("subtitles.list_for_video"))?;
        Ok(records)
    }

    /// The track for a `(video, language)` pair, if stored.
    ///
    /// # Errors
    ///
    /// Returns an error when the database operation fails.
    pub async fn fetch(
        &self,
        video_id: Uuid,
        language_code: &str,
    ) -> Result<Option<SubtitleRecord>> {
        let record = sqlx::query_as::<_, SubtitleRecord>(
            r"
            SELECT id, video_id, language_code, file_path, format, source, created_at
            FROM subtitles
            WHERE video_id = $1 AND language_code = $2
            ",
        )
        .bind(video_id)
        .bind(language_code)
        .fetch_optional(&self.pool)
        .await
        .map_err(query("subtitles.fetch"))?;
        Ok(record)
    }
}
