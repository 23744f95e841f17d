#![forbid(unsafe_code)]
#![deny(
    unused_must_use,
    unreachable_pub,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]
#![allow(clippy::module_name_repetitions)]

//! Download job lifecycle: the state machine, idempotent initiation, the
//! in-process registry of running engine sessions, and the worker pools
//! consuming the durable queues.

pub mod error;
pub mod manager;
pub mod messages;
pub mod registry;
pub mod worker;

pub use error::{JobError, Result};
pub use manager::{InitiateRequest, JobManager, transition_allowed};
pub use messages::{ConversionMessage, DownloadMessage};
pub use registry::ActiveDownloads;
pub use worker::{WorkerPool, WorkerSettings};
