//! Shared state threaded through the HTTP handlers.

use std::sync::Arc;

use vidra_cache::CacheManager;
use vidra_data::SubtitleStore;
use vidra_events::EventBus;
use vidra_jobs::JobManager;
use vidra_media::SubtitleWriter;

use crate::http::auth::AuthGate;

/// Dependency bundle for the API handlers.
#[derive(Clone)]
pub struct ApiState {
    /// Job lifecycle coordinator.
    pub manager: JobManager,
    /// Cache policy layer.
    pub cache: CacheManager,
    /// Subtitle record store.
    pub subtitles: SubtitleStore,
    /// Subtitle file writer.
    pub subtitle_writer: SubtitleWriter,
    /// Shared event bus.
    pub events: EventBus,
    /// Authentication boundary (also used standalone by the middleware).
    pub auth: Arc<AuthGate>,
}

impl ApiState {
    /// Bundle the handler dependencies.
    #[must_use]
    pub fn new(
        manager: JobManager,
        cache: CacheManager,
        subtitles: SubtitleStore,
        subtitle_writer: SubtitleWriter,
        events: EventBus,
        auth: Arc<AuthGate>,
    ) -> Self {
        Self {
            manager,
            cache,
            subtitles,
            subtitle_writer,
            events,
            auth,
        }
    }
}
