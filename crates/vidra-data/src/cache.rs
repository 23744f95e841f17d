//! Persistence for cached video artifacts.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::error::{Result, query};

/// Fields recorded when a completed artifact is adopted by the cache.
#[derive(Debug, Clone)]
pub struct NewCachedVideo {
    /// Identifier for the cache row.
    pub id: Uuid,
    /// Video the artifact belongs to.
    pub video_id: Uuid,
    /// Torrent the artifact was downloaded from.
    pub torrent_id: Uuid,
    /// Absolute path of the playable file.
    pub file_path: String,
    /// File size in bytes.
    pub file_size: u64,
    /// Container format (e.g. `mp4`), when probed.
    pub format: Option<String>,
    /// Video codec (e.g. `h264`), when probed.
    pub codec: Option<String>,
    /// Display resolution (e.g. `1920x1080`), when probed.
    pub resolution: Option<String>,
    /// Duration in seconds, when probed.
    pub duration_seconds: Option<u64>,
    /// Overall bitrate in bits per second, when probed.
    pub bitrate: Option<u64>,
    /// Expiry instant (`cached_at + TTL`).
    pub expires_at: DateTime<Utc>,
}

/// A cached artifact row.
#[derive(Debug, Clone, FromRow)]
pub struct CachedVideoRecord {
    /// Identifier for the cache row.
    pub id: Uuid,
    /// Video the artifact belongs to.
    pub video_id: Uuid,
    /// Torrent the artifact was downloaded from.
    pub torrent_id: Uuid,
    /// Absolute path of the playable file.
    pub file_path: String,
    /// File size in bytes.
    pub file_size: i64,
    /// Container format, when probed.
    pub format: Option<String>,
    /// Video codec, when probed.
    pub codec: Option<String>,
    /// Display resolution, when probed.
    pub resolution: Option<String>,
    /// Duration in seconds, when probed.
    pub duration_seconds: Option<i64>,
    /// Overall bitrate, when probed.
    pub bitrate: Option<i64>,
    /// When the artifact was cached.
    pub cached_at: DateTime<Utc>,
    /// Last stream-open instant.
    pub last_accessed_at: DateTime<Utc>,
    /// Expiry instant.
    pub expires_at: DateTime<Utc>,
    /// Number of stream opens.
    pub access_count: i64,
}

/// Aggregate cache statistics.
#[derive(Debug, Clone, Copy, FromRow)]
pub struct CacheStats {
    /// Number of cached artifacts.
    pub entry_count: i64,
    /// Sum of artifact sizes in bytes.
    pub total_bytes: i64,
}

const SELECT_COLUMNS: &str = r"
    SELECT id, video_id, torrent_id, file_path, file_size, format, codec,
           resolution, duration_seconds, bitrate, cached_at, last_accessed_at,
           expires_at, access_count
    FROM cached_videos
";

/// Database-backed repository for cached artifacts.
#[derive(Clone)]
pub struct CacheStore {
    pool: PgPool,
}

impl CacheStore {
    /// Wrap a connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record (or refresh) the artifact for a `(video, torrent)` pair.
    ///
    /// # Errors
    ///
    /// Returns an error when the database operation fails.
    pub async fn upsert(&self, new: &NewCachedVideo) -> Result<CachedVideoRecord> {
        let record = sqlx::query_as::<_, CachedVideoRecord>(
            r"
            INSERT INTO cached_videos (id, video_id, torrent_id, file_path, file_size,
                                       format, codec, resolution, duration_seconds,
                                       bitrate, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT ON CONSTRAINT cached_videos_video_torrent DO UPDATE
            SET file_path = EXCLUDED.file_path,
                file_size = EXCLUDED.file_size,
                format = EXCLUDED.format,
                codec = EXCLUDED.codec,
                resolution = EXCLUDED.resolution,
                duration_seconds = EXCLUDED.duration_seconds,
                bitrate = EXCLUDED.bitrate,
                cached_at = now(),
                last_accessed_at = now(),
                expires_at = EXCLUDED.expires_at
            RETURNING id, video_id, torrent_id, file_path, file_size, format, codec,
                      resolution, duration_seconds, bitrate, cached_at,
                      last_accessed_at, expires_at, access_count
            ",
        )
        .bind(new.id)
        .bind(new.video_id)
        .bind(new.torrent_id)
        .bind(&new.file_path)
        .bind(i64::try_from(new.file_size).unwrap_or(i64::MAX))
        .bind(new.format.as_deref())
        .bind(new.codec.as_deref())
        .bind(new.resolution.as_deref())
        .bind(new.duration_seconds.and_then(|value| i64::try_from(value).ok()))
        .bind(new.bitrate.and_then(|value| i64::try_from(value).ok()))
        .bind(new.expires_at)
        .fetch_one(&self.pool)
        .await
        .map_err(query("cache.upsert"))?;
        Ok(record)
    }

    /// Fetch by row id.
    ///
    /// # Errors
    ///
    /// Returns an error when the database operation fails.
    pub async fn fetch(&self, id: Uuid) -> Result<Option<CachedVideoRecord>> {
        let record = sqlx::query_as::<_, CachedVideoRecord>(&format!(
            "{SELECT_COLUMNS} WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(query("cache.fetch"))?;
        Ok(record)
    }

    /// Fetch the artifact for a `(video, torrent)` pair.
    ///
    /// # Errors
    ///
    /// Returns an error when the database operation fails.
    pub async fn fetch_pair(
        &self,
        video_id: Uuid,
        torrent_id: Uuid,
    ) -> Result<Option<CachedVideoRecord>> {
        let record = sqlx::query_as::<_, CachedVideoRecord>(&format!(
            "{SELECT_COLUMNS} WHERE video_id = $1 AND torrent_id = $2"
        ))
        .bind(video_id)
        .bind(torrent_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(query("cache.fetch_pair"))?;
        Ok(record)
    }

    /// Row-atomic access bump on stream open.
    ///
    /// # Errors
    ///
    /// Returns an error when the database operation fails.
    pub async fn touch(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE cached_videos SET last_accessed_at = now(), access_count = access_count + 1 WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(query("cache.touch"))?;
        Ok(())
    }

    /// Records whose TTL has lapsed.
    ///
    /// # Errors
    ///
    /// Returns an error when the database operation fails.
    pub async fn expired(&self) -> Result<Vec<CachedVideoRecord>> {
        let records = sqlx::query_as::<_, CachedVideoRecord>(&format!(
            "{SELECT_COLUMNS} WHERE expires_at <= now() ORDER BY expires_at ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(query("cache.expired"))?;
        Ok(records)
    }

    /// Live records in least-recently-accessed order, for capacity eviction.
    ///
    /// # Errors
    ///
    /// Returns an error when the database operation fails.
    pub async fn lru_candidates(&self) -> Result<Vec<CachedVideoRecord>> {
        let records = sqlx::query_as::<_, CachedVideoRecord>(&format!(
            "{SELECT_COLUMNS} WHERE expires_at > now() ORDER BY last_accessed_at ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(query("cache.lru_candidates"))?;
        Ok(records)
    }

    /// Delete a record only if it has not been accessed since it was listed
    /// for eviction; returns whether the row went away.
    ///
    /// # Errors
    ///
    /// Returns an error when the database operation fails.
    pub async fn delete_if_untouched(
        &self,
        id: Uuid,
        seen_last_accessed: DateTime<Utc>,
    ) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM cached_videos WHERE id = $1 AND last_accessed_at = $2")
                .bind(id)
                .bind(seen_last_accessed)
                .execute(&self.pool)
                .await
                .map_err(query("cache.delete_if_untouched"))?;
        Ok(result.rows_affected() == 1)
    }

    /// Unconditional delete (TTL expiry).
    ///
    /// # Errors
    ///
    /// Returns an error when the database operation fails.
    pub async fn delete(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM cached_videos WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(query("cache.delete"))?;
        Ok(result.rows_affected() == 1)
    }

    /// Aggregate statistics for the stats endpoint and the sweeper.
    ///
    /// # Errors
    ///
    /// Returns an error when the database operation fails.
    pub async fn stats(&self) -> Result<CacheStats> {
        let stats = sqlx::query_as::<_, CacheStats>(
            "SELECT COUNT(*) AS entry_count, COALESCE(SUM(file_size), 0)::BIGINT AS total_bytes FROM cached_videos",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(query("cache.stats"))?;
        Ok(stats)
    }
}
