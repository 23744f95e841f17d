//! Typed configuration models.
//!
//! # Design
//! - Pure data carriers deserialised from the configuration file.
//! - Defaults live in `defaults.rs`; validation lives in `validate.rs`.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::defaults;

/// Root configuration injected into every component at startup.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// HTTP listener settings.
    #[serde(default)]
    pub http: HttpConfig,
    /// On-disk layout roots.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Swarm and peer-connection settings.
    #[serde(default)]
    pub torrent: TorrentConfig,
    /// Cache retention and reclamation settings.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Durable queue and worker-pool settings.
    #[serde(default)]
    pub queues: QueueConfig,
    /// Authentication boundary settings.
    #[serde(default)]
    pub auth: AuthConfig,
    /// External media tooling.
    #[serde(default)]
    pub media: MediaConfig,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpConfig {
    /// Address the API server binds to.
    #[serde(default = "defaults::bind_addr")]
    pub bind_addr: IpAddr,
    /// Port the API server binds to.
    #[serde(default = "defaults::http_port")]
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_addr: defaults::bind_addr(),
            port: defaults::http_port(),
        }
    }
}

/// On-disk layout roots. Completed artifacts live under
/// `<base_path>/videos/<job_id>/`, partials under `<temp_path>/<job_id>/`,
/// subtitles under `<subtitle_path>/<video_id>/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// Root for completed video artifacts.
    #[serde(default = "defaults::base_path")]
    pub base_path: PathBuf,
    /// Root for in-progress download scratch space.
    #[serde(default = "defaults::temp_path")]
    pub temp_path: PathBuf,
    /// Root for stored subtitle tracks.
    #[serde(default = "defaults::subtitle_path")]
    pub subtitle_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_path: defaults::base_path(),
            temp_path: defaults::temp_path(),
            subtitle_path: defaults::subtitle_path(),
        }
    }
}

/// Swarm and peer-connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TorrentConfig {
    /// First port advertised to trackers for incoming connections.
    #[serde(default = "defaults::torrent_port_range_start")]
    pub port_range_start: u16,
    /// Last port advertised to trackers for incoming connections.
    #[serde(default = "defaults::torrent_port_range_end")]
    pub port_range_end: u16,
    /// Global cap on simultaneously open peer sockets across all jobs.
    #[serde(default = "defaults::max_connections")]
    pub max_connections: u32,
    /// Per-job cap on opened peer connections.
    #[serde(default = "defaults::max_peers")]
    pub max_peers: u32,
    /// Per-job cap on simultaneously active (unchoked, interested) peers.
    #[serde(default = "defaults::max_active_peers")]
    pub max_active_peers: u32,
}

impl Default for TorrentConfig {
    fn default() -> Self {
        Self {
            port_range_start: defaults::torrent_port_range_start(),
            port_range_end: defaults::torrent_port_range_end(),
            max_connections: defaults::max_connections(),
            max_peers: defaults::max_peers(),
            max_active_peers: defaults::max_active_peers(),
        }
    }
}

/// Cache retention and reclamation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Hard cap on total cached bytes, in GiB.
    #[serde(default = "defaults::max_cache_size_gb")]
    pub max_cache_size_gb: u64,
    /// Lifetime of a cached artifact, in days.
    #[serde(default = "defaults::cache_ttl_days")]
    pub cache_ttl_days: u32,
    /// Interval between sweeper runs, in hours.
    #[serde(default = "defaults::cleanup_interval_hours")]
    pub cleanup_interval_hours: u32,
}

impl CacheConfig {
    /// Hard cap on total cached bytes.
    #[must_use]
    pub const fn max_cache_bytes(&self) -> u64 {
        self.max_cache_size_gb * 1024 * 1024 * 1024
    }

    /// Lifetime applied to newly cached artifacts.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_days as u64 * 24 * 60 * 60)
    }

    /// Interval between sweeper runs.
    #[must_use]
    pub const fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_hours as u64 * 60 * 60)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_cache_size_gb: defaults::max_cache_size_gb(),
            cache_ttl_days: defaults::cache_ttl_days(),
            cleanup_interval_hours: defaults::cleanup_interval_hours(),
        }
    }
}

/// Durable queue and worker-pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueConfig {
    /// TTL for messages on the download queue, in seconds.
    #[serde(default = "defaults::download_queue_ttl_seconds")]
    pub download_ttl_seconds: u64,
    /// TTL for messages on the conversion queue, in seconds.
    #[serde(default = "defaults::conversion_queue_ttl_seconds")]
    pub conversion_ttl_seconds: u64,
    /// Number of workers consuming the download queue.
    #[serde(default = "defaults::download_workers")]
    pub download_workers: u32,
    /// Number of workers consuming the conversion queue.
    #[serde(default = "defaults::conversion_workers")]
    pub conversion_workers: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            download_ttl_seconds: defaults::download_queue_ttl_seconds(),
            conversion_ttl_seconds: defaults::conversion_queue_ttl_seconds(),
            download_workers: defaults::download_workers(),
            conversion_workers: defaults::conversion_workers(),
        }
    }
}

/// Authentication boundary settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    /// Shared HS256 secret used to validate bearer tokens. Must be at least
    /// 32 bytes and not a known placeholder; startup refuses otherwise.
    #[serde(default)]
    pub jwt_secret: String,
    /// Expected `iss` claim.
    #[serde(default = "defaults::jwt_issuer")]
    pub jwt_issuer: String,
    /// Expected `aud` claim.
    #[serde(default = "defaults::jwt_audience")]
    pub jwt_audience: String,
    /// bcrypt cost factor applied when hashing credentials upstream.
    #[serde(default = "defaults::bcrypt_cost")]
    pub bcrypt_cost: u32,
    /// Token-bucket limits applied per authenticated identity.
    #[serde(default = "defaults::identity_rate_limit")]
    pub identity_rate_limit: RateLimitConfig,
    /// Token-bucket limits applied per source IP before validation.
    #[serde(default = "defaults::ip_rate_limit")]
    pub ip_rate_limit: RateLimitConfig,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            jwt_issuer: defaults::jwt_issuer(),
            jwt_audience: defaults::jwt_audience(),
            bcrypt_cost: defaults::bcrypt_cost(),
            identity_rate_limit: defaults::identity_rate_limit(),
            ip_rate_limit: defaults::ip_rate_limit(),
        }
    }
}

/// Token-bucket rate limit configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Maximum number of requests allowed within a replenishment window.
    pub burst: u32,
    /// Length of the replenishment window, in seconds.
    pub per_seconds: u64,
}

impl RateLimitConfig {
    /// Duration of the replenishment window.
    #[must_use]
    pub const fn replenish_period(&self) -> Duration {
        Duration::from_secs(self.per_seconds)
    }
}

/// External media tooling paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MediaConfig {
    /// Path to the `ffmpeg` binary.
    #[serde(default = "defaults::ffmpeg_path")]
    pub ffmpeg_path: PathBuf,
    /// Path to the `ffprobe` binary.
    #[serde(default = "defaults::ffprobe_path")]
    pub ffprobe_path: PathBuf,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: defaults::ffmpeg_path(),
            ffprobe_path: defaults::ffprobe_path(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.cache.max_cache_size_gb, 100);
        assert_eq!(config.cache.cache_ttl_days, 30);
        assert_eq!(config.cache.cleanup_interval_hours, 6);
        assert_eq!(config.torrent.port_range_start, 6881);
        assert_eq!(config.torrent.port_range_end, 6889);
        assert_eq!(config.torrent.max_connections, 200);
        assert_eq!(config.auth.bcrypt_cost, 12);
    }

    #[test]
    fn cache_helpers_convert_units() {
        let cache = CacheConfig {
            max_cache_size_gb: 2,
            cache_ttl_days: 1,
            cleanup_interval_hours: 6,
        };
        assert_eq!(cache.max_cache_bytes(), 2 * 1024 * 1024 * 1024);
        assert_eq!(cache.ttl(), Duration::from_secs(86_400));
        assert_eq!(cache.cleanup_interval(), Duration::from_secs(6 * 3_600));
    }

    #[test]
    fn config_rejects_unknown_fields() {
        let parsed: Result<AppConfig, _> =
            serde_json::from_str(r#"{"http": {"port": 8080, "bogus": 1}}"#);
        assert!(parsed.is_err(), "unknown fields must be rejected");
    }
}
