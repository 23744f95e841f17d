#![forbid(unsafe_code)]
#![deny(
    unused_must_use,
    unreachable_pub,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]
#![allow(clippy::module_name_repetitions)]

//! Bounded on-disk cache of playable artifacts.
//!
//! Records live in Postgres (see `vidra-data`); this crate owns the policy:
//! TTL assignment on adoption, access bumps plus read-guards on stream open,
//! and the periodic sweeper that deletes expired records and evicts by
//! least-recent access when the size cap is exceeded. A record with live
//! readers is never evicted; its turn comes on a later sweep.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;
use vidra_data::{CacheStats, CacheStore, CachedVideoRecord, DataResult, NewCachedVideo};
use vidra_events::{Event, EventBus};

/// Fraction of the size cap the sweeper evicts down to.
const SOFT_LIMIT_RATIO: f64 = 0.9;

/// Facts about one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Records removed because their TTL lapsed.
    pub expired_removed: usize,
    /// Records evicted to get back under the size cap.
    pub evicted: usize,
    /// Bytes reclaimed by eviction.
    pub reclaimed_bytes: u64,
    /// Records skipped because a stream was reading them.
    pub deferred: usize,
}

/// Cache policy layer over the record store and the filesystem.
#[derive(Clone)]
pub struct CacheManager {
    store: CacheStore,
    events: EventBus,
    readers: Arc<Mutex<HashMap<Uuid, usize>>>,
    max_bytes: u64,
    ttl: Duration,
}

impl CacheManager {
    /// Wire a manager over its collaborators.
    #[must_use]
    pub fn new(store: CacheStore, events: EventBus, max_bytes: u64, ttl: Duration) -> Self {
        Self {
            store,
            events,
            readers: Arc::new(Mutex::new(HashMap::new())),
            max_bytes,
            ttl,
        }
    }

    /// The underlying record store.
    #[must_use]
    pub const fn store(&self) -> &CacheStore {
        &self.store
    }

    /// Adopt a completed artifact: insert the record with
    /// `expires_at = now + TTL`.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    pub async fn adopt(&self, mut new: NewCachedVideo) -> DataResult<CachedVideoRecord> {
        new.expires_at = Utc::now()
            + chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::days(30));
        let record = self.store.upsert(&new).await?;
        self.events.publish(Event::VideoCached {
            video_id: record.video_id,
            torrent_id: record.torrent_id,
            file_size: u64::try_from(record.file_size).unwrap_or_default(),
        });
        Ok(record)
    }

    /// Open a record for streaming: bumps `last_accessed_at`/`access_count`
    /// and takes a read-guard that blocks eviction until dropped.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    pub async fn open_stream(&self, record: &CachedVideoRecord) -> DataResult<StreamGuard> {
        self.store.touch(record.id).await?;
        *self.lock_readers().entry(record.id).or_insert(0) += 1;
        Ok(StreamGuard {
            id: record.id,
            readers: Arc::clone(&self.readers),
        })
    }

    /// Number of live readers on a record.
    #[must_use]
    pub fn active_readers(&self, id: Uuid) -> usize {
        self.lock_readers().get(&id).copied().unwrap_or(0)
    }

    /// Aggregate statistics.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    pub async fn stats(&self) -> DataResult<CacheStats> {
        self.store.stats().await
    }

    /// The configured size cap in bytes.
    #[must_use]
    pub const fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// One sweeper pass: drop expired records, then evict least-recently
    /// accessed records until the total size is back under the soft limit.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures; file removal failures are logged and
    /// do not abort the sweep.
    pub async fn sweep(&self) -> DataResult<SweepReport> {
        let mut report = SweepReport::default();

        for record in self.store.expired().await? {
            if self.active_readers(record.id) > 0 {
                report.deferred += 1;
                continue;
            }
            if self.store.delete(record.id).await? {
                self.remove_artifact(&record.file_path).await;
                report.expired_removed += 1;
                self.events.publish(Event::CacheEvicted {
                    video_id: record.video_id,
                    reason: "expired".to_string(),
                });
            }
        }

        let stats = self.store.stats().await?;
        let total = u64::try_from(stats.total_bytes).unwrap_or_default();
        if total <= self.max_bytes {
            if report.expired_removed > 0 || report.deferred > 0 {
                info!(?report, "cache sweep finished");
            }
            return Ok(report);
        }

        let records = self.store.lru_candidates().await?;
        let candidates: Vec<(Uuid, u64, usize)> = records
            .iter()
            .map(|record| {
                let readers = self.active_readers(record.id);
                if readers > 0 {
                    report.deferred += 1;
                }
                (
                    record.id,
                    u64::try_from(record.file_size).unwrap_or_default(),
                    readers,
                )
            })
            .collect();
        let planned: std::collections::HashSet<Uuid> =
            plan_eviction(&candidates, total, self.max_bytes)
                .into_iter()
                .collect();

        for record in &records {
            if !planned.contains(&record.id) {
                continue;
            }
            // the access timestamp is re-checked inside the delete so a
            // just-opened stream wins the race
            if self
                .store
                .delete_if_untouched(record.id, record.last_accessed_at)
                .await?
            {
                self.remove_artifact(&record.file_path).await;
                let size = u64::try_from(record.file_size).unwrap_or_default();
                report.evicted += 1;
                report.reclaimed_bytes += size;
                self.events.publish(Event::CacheEvicted {
                    video_id: record.video_id,
                    reason: "capacity".to_string(),
                });
            }
        }

        info!(?report, "cache sweep finished");
        Ok(report)
    }

    /// Spawn the periodic sweeper task.
    #[must_use]
    pub fn spawn_sweeper(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(
                tokio::time::Instant::now() + interval,
                interval,
            );
            loop {
                ticker.tick().await;
                if let Err(err) = manager.sweep().await {
                    warn!(error = %err, "cache sweep failed");
                }
            }
        })
    }

    async fn remove_artifact(&self, path: &str) {
        if let Err(err) = tokio::fs::remove_file(path).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path, error = %err, "failed to remove cached artifact");
            }
        }
        // prune the now-empty job directory when possible
        if let Some(parent) = std::path::Path::new(path).parent() {
            let _ = tokio::fs::remove_dir(parent).await;
        }
    }

    fn lock_readers(&self) -> MutexGuard<'_, HashMap<Uuid, usize>> {
        match self.readers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// RAII read-guard for a cached record; dropping it releases the reader.
pub struct StreamGuard {
    id: Uuid,
    readers: Arc<Mutex<HashMap<Uuid, usize>>>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        let mut readers = match self.readers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(count) = readers.get_mut(&self.id) {
            *count -= 1;
            if *count == 0 {
                readers.remove(&self.id);
            }
        }
    }
}

/// Target size after a capacity eviction pass.
#[must_use]
pub fn soft_limit(max_bytes: u64) -> u64 {
    (max_bytes as f64 * SOFT_LIMIT_RATIO) as u64
}

/// Pure eviction planning over an LRU-ordered candidate list: the smallest
/// prefix (skipping records with live readers) whose removal brings `total`
/// under the soft limit.
#[must_use]
pub fn plan_eviction(
    candidates: &[(Uuid, u64, usize)],
    total: u64,
    max_bytes: u64,
) -> Vec<Uuid> {
    let soft = soft_limit(max_bytes);
    let mut remaining = total;
    let mut plan = Vec::new();
    if remaining <= max_bytes {
        return plan;
    }
    for (id, size, readers) in candidates {
        if remaining <= soft {
            break;
        }
        if *readers > 0 {
            continue;
        }
        plan.push(*id);
        remaining = remaining.saturating_sub(*size);
    }
    plan
}
