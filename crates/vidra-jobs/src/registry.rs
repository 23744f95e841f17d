//! In-process registry of running engine sessions.
//!
//! A job owns at most one active peer-protocol session; the registry is how
//! the HTTP layer reaches a running session to cancel it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::warn;
use uuid::Uuid;
use vidra_torrent::DownloadHandle;

/// Shared map of job id to the handle of its running download session.
#[derive(Clone, Default)]
pub struct ActiveDownloads {
    inner: Arc<Mutex<HashMap<Uuid, DownloadHandle>>>,
}

impl ActiveDownloads {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session for a job. A job never has two live sessions; a
    /// pre-existing handle is discarded with a warning.
    pub fn insert(&self, job_id: Uuid, handle: DownloadHandle) {
        let mut map = self.lock();
        if map.insert(job_id, handle).is_some() {
            warn!(%job_id, "replaced a live download handle; this should not happen");
        }
    }

    /// Remove the handle when its session ends.
    pub fn remove(&self, job_id: Uuid) {
        self.lock().remove(&job_id);
    }

    /// Signal cancellation to the job's session, if one is running.
    /// Returns whether a session was signalled.
    #[must_use]
    pub fn cancel(&self, job_id: Uuid) -> bool {
        let map = self.lock();
        map.get(&job_id).map(DownloadHandle::cancel).is_some()
    }

    /// Number of running sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no sessions are running.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, DownloadHandle>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
