//! Startup validation of the loaded configuration.

use crate::error::{ConfigError, Result};
use crate::model::AppConfig;

/// Secret values that must never make it to production.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "changeme",
    "secret",
    "development",
    "00000000000000000000000000000000",
];

/// Validate invariants that cannot be expressed in the type system.
///
/// # Errors
///
/// Returns the first violated invariant as an [`ConfigError::InvalidField`].
pub fn validate(config: &AppConfig) -> Result<()> {
    let secret = config.auth.jwt_secret.as_bytes();
    if secret.len() < 32 {
        return Err(ConfigError::InvalidField {
            section: "auth",
            field: "jwt_secret",
            reason: "must be at least 32 bytes",
        });
    }
    if PLACEHOLDER_SECRETS
        .iter()
        .any(|known| config.auth.jwt_secret.eq_ignore_ascii_case(known))
    {
        return Err(ConfigError::InvalidField {
            section: "auth",
            field: "jwt_secret",
            reason: "placeholder value refused",
        });
    }

    if !(4..=31).contains(&config.auth.bcrypt_cost) {
        return Err(ConfigError::InvalidField {
            section: "auth",
            field: "bcrypt_cost",
            reason: "must be between 4 and 31",
        });
    }

    if config.torrent.port_range_start > config.torrent.port_range_end {
        return Err(ConfigError::InvalidField {
            section: "torrent",
            field: "port_range_start",
            reason: "must not exceed port_range_end",
        });
    }
    if config.torrent.max_peers == 0 || config.torrent.max_active_peers == 0 {
        return Err(ConfigError::InvalidField {
            section: "torrent",
            field: "max_peers",
            reason: "peer caps must be positive",
        });
    }
    if config.torrent.max_active_peers > config.torrent.max_peers {
        return Err(ConfigError::InvalidField {
            section: "torrent",
            field: "max_active_peers",
            reason: "must not exceed max_peers",
        });
    }

    if config.cache.max_cache_size_gb == 0 {
        return Err(ConfigError::InvalidField {
            section: "cache",
            field: "max_cache_size_gb",
            reason: "must be positive",
        });
    }
    if config.cache.cleanup_interval_hours == 0 {
        return Err(ConfigError::InvalidField {
            section: "cache",
            field: "cleanup_interval_hours",
            reason: "must be positive",
        });
    }

    if config.queues.download_workers == 0 || config.queues.conversion_workers == 0 {
        return Err(ConfigError::InvalidField {
            section: "queues",
            field: "download_workers",
            reason: "worker pools must have at least one worker",
        });
    }

    if config.auth.identity_rate_limit.burst == 0 || config.auth.ip_rate_limit.burst == 0 {
        return Err(ConfigError::InvalidField {
            section: "auth",
            field: "identity_rate_limit",
            reason: "rate limit burst must be positive",
        });
    }

    Ok(())
}
