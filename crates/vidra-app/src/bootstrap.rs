//! Application bootstrap: configuration, persistence, workers, sweeper, API.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use vidra_api::http::auth::AuthGate;
use vidra_api::{ApiServer, ApiState};
use vidra_cache::CacheManager;
use vidra_config::AppConfig;
use vidra_data::{CacheStore, JobStore, QueueStore, SubtitleStore};
use vidra_events::EventBus;
use vidra_jobs::{ActiveDownloads, JobManager, WorkerPool, WorkerSettings};
use vidra_media::{SubtitleWriter, Transcoder};
use vidra_telemetry::LoggingConfig;
use vidra_torrent::EngineConfig;

use crate::error::{AppError, AppResult};

/// Sleep between polls of an empty queue.
const WORKER_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Queue lease; downloads extend it while making progress.
const WORKER_LEASE: Duration = Duration::from_secs(300);

/// Entry point for the Vidra application boot sequence.
///
/// # Errors
///
/// Returns an error if configuration, persistence, or the HTTP listener
/// cannot be brought up.
pub async fn run_app() -> AppResult<()> {
    vidra_telemetry::init_logging(&LoggingConfig::default()).map_err(AppError::Telemetry)?;

    let config_path = std::env::var("VIDRA_CONFIG").ok().map(PathBuf::from);
    let config = vidra_config::load(config_path.as_deref())?;

    let database_url = std::env::var("DATABASE_URL").map_err(|_| AppError::MissingEnv {
        name: "DATABASE_URL",
    })?;

    info!("Vidra application bootstrap starting");
    let pool = vidra_data::connect(&database_url).await?;
    vidra_data::run_migrations(&pool).await?;

    let events = EventBus::new();
    let jobs = JobStore::new(pool.clone());
    let queue = QueueStore::new(pool.clone());
    let cache_store = CacheStore::new(pool.clone());
    let subtitles = SubtitleStore::new(pool);

    let registry = ActiveDownloads::new();
    let manager = JobManager::new(
        jobs,
        queue.clone(),
        events.clone(),
        registry.clone(),
        Duration::from_secs(config.queues.download_ttl_seconds),
    );
    let cache = CacheManager::new(
        cache_store,
        events.clone(),
        config.cache.max_cache_bytes(),
        config.cache.ttl(),
    );
    let transcoder = Transcoder::new(
        config.media.ffmpeg_path.clone(),
        config.media.ffprobe_path.clone(),
    );

    let workers = WorkerPool::new(
        manager.clone(),
        queue,
        cache.clone(),
        events.clone(),
        transcoder,
        registry,
        worker_settings(&config),
    );
    let worker_handles = workers.spawn();
    let sweeper = cache.spawn_sweeper(config.cache.cleanup_interval());

    let auth = Arc::new(AuthGate::new(&config.auth));
    let subtitle_writer = SubtitleWriter::new(config.storage.subtitle_path.clone());
    let state = ApiState::new(
        manager,
        cache,
        subtitles,
        subtitle_writer,
        events,
        auth,
    );

    let addr = SocketAddr::new(config.http.bind_addr, config.http.port);
    let serve_result = ApiServer::new(state).serve(addr).await;

    for handle in worker_handles {
        handle.abort();
    }
    sweeper.abort();
    if let Err(err) = &serve_result {
        warn!(error = %err, "API server terminated with error");
    }
    serve_result?;
    info!("API server shutdown complete");
    Ok(())
}

fn worker_settings(config: &AppConfig) -> WorkerSettings {
    // the global socket budget is split across concurrent download workers
    let per_job_cap = (config.torrent.max_connections
        / config.queues.download_workers.max(1))
    .max(1) as usize;
    let max_peers = (config.torrent.max_peers as usize).min(per_job_cap);
    let engine = EngineConfig {
        max_peers,
        max_active_peers: (config.torrent.max_active_peers as usize).min(max_peers),
        announce_port: config.torrent.port_range_start,
        ..EngineConfig::default()
    };

    WorkerSettings {
        download_workers: config.queues.download_workers,
        conversion_workers: config.queues.conversion_workers,
        conversion_ttl: Duration::from_secs(config.queues.conversion_ttl_seconds),
        poll_interval: WORKER_POLL_INTERVAL,
        lease: WORKER_LEASE,
        temp_path: config.storage.temp_path.clone(),
        videos_path: config.storage.base_path.join("videos"),
        engine,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_settings_split_the_connection_budget() {
        let mut config = AppConfig::default();
        config.torrent.max_connections = 200;
        config.queues.download_workers = 4;
        let settings = worker_settings(&config);
        assert_eq!(settings.engine.max_peers, 50);
        assert_eq!(settings.engine.max_active_peers, 20);
        assert_eq!(settings.engine.announce_port, 6881);
    }

    #[test]
    fn tight_connection_budgets_clamp_peer_caps() {
        let mut config = AppConfig::default();
        config.torrent.max_connections = 8;
        config.queues.download_workers = 4;
        let settings = worker_settings(&config);
        assert_eq!(settings.engine.max_peers, 2);
        assert_eq!(settings.engine.max_active_peers, 2);
    }

    #[test]
    fn video_root_nests_under_the_base_path() {
        let config = AppConfig::default();
        let settings = worker_settings(&config);
        assert!(settings.videos_path.ends_with("videos"));
    }
}
