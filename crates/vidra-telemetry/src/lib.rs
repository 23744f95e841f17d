#![forbid(unsafe_code)]
#![deny(
    unused_must_use,
    unreachable_pub,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]
#![allow(clippy::module_name_repetitions)]

//! Telemetry primitives shared across the Vidra workspace.
//!
//! Layout: `init.rs` (logging setup), `layers.rs` (request-id middleware).

pub mod init;
pub mod layers;

pub use init::{DEFAULT_LOG_LEVEL, LogFormat, LoggingConfig, init_logging};
pub use layers::{propagate_request_id_layer, set_request_id_layer};
