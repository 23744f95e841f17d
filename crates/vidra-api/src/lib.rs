#![forbid(unsafe_code)]
#![deny(
    unused_must_use,
    unreachable_pub,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]
#![allow(clippy::module_name_repetitions)]

//! HTTP API for the Vidra streaming service.
//!
//! Layout: `models.rs` (wire DTOs), `state.rs` (shared handler state),
//! `http/` (auth boundary, rate limiting, router, handlers, range logic).

pub mod http;
pub mod models;
pub mod state;

pub use http::router::ApiServer;
pub use state::ApiState;
