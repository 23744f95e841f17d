//! Fallback values applied when the configuration file omits a field.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use crate::model::RateLimitConfig;

pub(crate) fn bind_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

pub(crate) const fn http_port() -> u16 {
    8080
}

pub(crate) fn base_path() -> PathBuf {
    PathBuf::from("/var/lib/vidra")
}

pub(crate) fn temp_path() -> PathBuf {
    PathBuf::from("/var/lib/vidra/temp")
}

pub(crate) fn subtitle_path() -> PathBuf {
    PathBuf::from("/var/lib/vidra/subtitles")
}

pub(crate) const fn torrent_port_range_start() -> u16 {
    6881
}

pub(crate) const fn torrent_port_range_end() -> u16 {
    6889
}

pub(crate) const fn max_connections() -> u32 {
    200
}

pub(crate) const fn max_peers() -> u32 {
    50
}

pub(crate) const fn max_active_peers() -> u32 {
    20
}

pub(crate) const fn max_cache_size_gb() -> u64 {
    100
}

pub(crate) const fn cache_ttl_days() -> u32 {
    30
}

pub(crate) const fn cleanup_interval_hours() -> u32 {
    6
}

pub(crate) const fn download_queue_ttl_seconds() -> u64 {
    24 * 60 * 60
}

pub(crate) const fn conversion_queue_ttl_seconds() -> u64 {
    24 * 60 * 60
}

pub(crate) const fn download_workers() -> u32 {
    4
}

pub(crate) const fn conversion_workers() -> u32 {
    2
}

pub(crate) fn jwt_issuer() -> String {
    "vidra".to_string()
}

pub(crate) fn jwt_audience() -> String {
    "vidra-clients".to_string()
}

pub(crate) const fn bcrypt_cost() -> u32 {
    12
}

pub(crate) const fn identity_rate_limit() -> RateLimitConfig {
    RateLimitConfig {
        burst: 60,
        per_seconds: 60,
    }
}

pub(crate) const fn ip_rate_limit() -> RateLimitConfig {
    RateLimitConfig {
        burst: 120,
        per_seconds: 60,
    }
}

pub(crate) fn ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

pub(crate) fn ffprobe_path() -> PathBuf {
    PathBuf::from("ffprobe")
}
