#![forbid(unsafe_code)]
#![deny(
    unused_must_use,
    unreachable_pub,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]
#![allow(clippy::module_name_repetitions)]

//! Media tooling for Vidra: the ffmpeg/ffprobe transcoder gateway and
//! SRT→WebVTT subtitle handling.

pub mod error;
pub mod subtitles;
pub mod transcode;

pub use error::{MediaError, Result};
pub use subtitles::{SubtitleWriter, srt_to_vtt};
pub use transcode::{MediaInfo, Transcoder};
