#![forbid(unsafe_code)]
#![deny(
    unused_must_use,
    unreachable_pub,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]

//! Vidra application bootstrap wiring.
//!
//! Layout: `bootstrap.rs` (service wiring and launch), `error.rs` (startup
//! error taxonomy).

pub mod bootstrap;
pub mod error;

pub use bootstrap::run_app;
pub use error::{AppError, AppResult};
