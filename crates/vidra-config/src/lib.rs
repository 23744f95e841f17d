#![forbid(unsafe_code)]
#![deny(
    unused_must_use,
    unreachable_pub,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]
#![allow(clippy::module_name_repetitions)]

//! Typed configuration for the Vidra workspace.
//!
//! Layout: `model.rs` (data carriers), `defaults.rs` (fallback values),
//! `loader.rs` (JSON file + environment overlay), `validate.rs` (startup
//! validation), `error.rs` (error types).
//!
//! Configuration is loaded exactly once at startup and injected into every
//! component; nothing reads the environment on a hot path.

pub mod defaults;
pub mod error;
pub mod loader;
pub mod model;
pub mod validate;

pub use error::{ConfigError, Result as ConfigResult};
pub use loader::load;
pub use model::{
    AppConfig, AuthConfig, CacheConfig, HttpConfig, MediaConfig, QueueConfig, RateLimitConfig,
    StorageConfig, TorrentConfig,
};
pub use validate::validate;
