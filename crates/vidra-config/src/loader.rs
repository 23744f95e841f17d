//! Configuration loading: JSON file plus environment overlay.
//!
//! # Design
//! - The file is optional; every field has a default except the JWT secret,
//!   which must arrive via the file or `VIDRA_JWT_SECRET`.
//! - Environment overrides cover only the knobs that differ between
//!   deployments of the same artifact (listener, secret, database-adjacent
//!   paths). Everything else belongs in the file.

use std::path::Path;

use tracing::info;

use crate::error::{ConfigError, Result};
use crate::model::AppConfig;
use crate::validate;

/// Load, overlay and validate the application configuration.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, if an environment
/// override is malformed, or if validation rejects the resulting
/// configuration.
pub fn load(path: Option<&Path>) -> Result<AppConfig> {
    let mut config = match path {
        Some(path) => parse_file(path)?,
        None => AppConfig::default(),
    };

    apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
    validate::validate(&config)?;

    info!(
        base_path = %config.storage.base_path.display(),
        http_port = config.http.port,
        "configuration loaded"
    );
    Ok(config)
}

fn parse_file(path: &Path) -> Result<AppConfig> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn apply_env_overrides(
    config: &mut AppConfig,
    lookup: impl Fn(&'static str) -> Option<String>,
) -> Result<()> {
    if let Some(value) = lookup("VIDRA_HTTP_PORT") {
        config.http.port = value
            .parse()
            .map_err(|_| ConfigError::InvalidOverride {
                name: "VIDRA_HTTP_PORT",
                value,
            })?;
    }
    if let Some(value) = lookup("VIDRA_BIND_ADDR") {
        config.http.bind_addr = value
            .parse()
            .map_err(|_| ConfigError::InvalidOverride {
                name: "VIDRA_BIND_ADDR",
                value,
            })?;
    }
    if let Some(value) = lookup("VIDRA_JWT_SECRET") {
        config.auth.jwt_secret = value;
    }
    if let Some(value) = lookup("VIDRA_BASE_PATH") {
        config.storage.base_path = value.into();
    }
    if let Some(value) = lookup("VIDRA_TEMP_PATH") {
        config.storage.temp_path = value.into();
    }
    if let Some(value) = lookup("VIDRA_SUBTITLE_PATH") {
        config.storage.subtitle_path = value.into();
    }
    Ok(())
}
