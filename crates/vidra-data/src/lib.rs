#![forbid(unsafe_code)]
#![deny(
    unused_must_use,
    unreachable_pub,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]
#![allow(clippy::module_name_repetitions)]

//! Postgres data access layer for Vidra: migrations and the stores backing
//! download jobs, durable work queues, the video cache, and subtitles.
//!
//! Every store is a thin `PgPool` wrapper issuing plain parameterised
//! queries; domain rules (state machine validity, eviction policy) live with
//! the callers.

pub mod cache;
pub mod error;
pub mod jobs;
pub mod queue;
pub mod subtitles;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

pub use cache::{CacheStats, CacheStore, CachedVideoRecord, NewCachedVideo};
pub use error::{DataError, Result as DataResult};
pub use jobs::{JobRecord, JobStore, NewJob, ProgressUpdate};
pub use queue::{LeasedMessage, QueueName, QueueStore};
pub use subtitles::{NewSubtitle, SubtitleRecord, SubtitleStore};

/// Open a connection pool against `database_url`.
///
/// # Errors
///
/// Returns an error when the database is unreachable.
pub async fn connect(database_url: &str) -> DataResult<PgPool> {
    PgPoolOptions::new()
        .max_connections(16)
        .connect(database_url)
        .await
        .map_err(error::query("pool.connect"))
}

/// Apply all pending migrations.
///
/// # Errors
///
/// Returns an error when migration execution fails.
pub async fn run_migrations(pool: &PgPool) -> DataResult<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|source| DataError::MigrationFailed { source })
}
