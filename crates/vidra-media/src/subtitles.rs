//! SRT→WebVTT conversion and subtitle file layout.
//!
//! Conversion is deliberately minimal: a `WEBVTT` header is prepended and
//! the comma decimal separators on timestamp lines become dots. Everything
//! else passes through untouched.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use uuid::Uuid;

use crate::error::{MediaError, Result};

static TIMESTAMP_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d{2}:\d{2}:\d{2}),(\d{3}) --> (\d{2}:\d{2}:\d{2}),(\d{3})")
        .expect("timestamp pattern compiles")
});

/// Convert an SRT document to WebVTT.
///
/// The input is decoded as UTF-8 (lossily, subtitle files in the wild are
/// messy); the output is always valid UTF-8 starting with `WEBVTT\n\n`.
///
/// # Errors
///
/// [`MediaError::EmptySubtitleSource`] when the source holds no content.
pub fn srt_to_vtt(source: &[u8]) -> Result<String> {
    if source.is_empty() {
        return Err(MediaError::EmptySubtitleSource);
    }
    let text = String::from_utf8_lossy(source);
    let converted = TIMESTAMP_LINE.replace_all(&text, "$1.$2 --> $3.$4");
    Ok(format!("WEBVTT\n\n{converted}"))
}

/// Writes subtitle tracks under `<base>/<video_id>/<language>.<format>`.
#[derive(Debug, Clone)]
pub struct SubtitleWriter {
    base: PathBuf,
}

impl SubtitleWriter {
    /// A writer rooted at `base`.
    #[must_use]
    pub const fn new(base: PathBuf) -> Self {
        Self { base }
    }

    /// The storage path for a `(video, language)` pair.
    #[must_use]
    pub fn path_for(&self, video_id: Uuid, language: &str, format: &str) -> PathBuf {
        self.base
            .join(video_id.to_string())
            .join(format!("{language}.{format}"))
    }

    /// Convert an SRT source and store it as the video's WebVTT track.
    ///
    /// Written via a staging file and an atomic rename, so a failed
    /// conversion never leaves partial output at the final path.
    ///
    /// # Errors
    ///
    /// Fails on empty sources and filesystem errors.
    pub async fn store_srt_as_vtt(
        &self,
        video_id: Uuid,
        language: &str,
        source: &[u8],
    ) -> Result<PathBuf> {
        let content = srt_to_vtt(source)?;
        self.store_vtt(video_id, language, &content).await
    }

    /// Store ready-made WebVTT content for a video.
    ///
    /// # Errors
    ///
    /// Fails on empty content and filesystem errors.
    pub async fn store_vtt(
        &self,
        video_id: Uuid,
        language: &str,
        content: &str,
    ) -> Result<PathBuf> {
        if content.is_empty() {
            return Err(MediaError::EmptySubtitleSource);
        }
        let destination = self.path_for(video_id, language, "vtt");
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let staging = staging_path(&destination);
        tokio::fs::write(&staging, content).await?;
        tokio::fs::rename(&staging, &destination).await?;
        Ok(destination)
    }
}

fn staging_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vidra_test_support::fixtures;

    #[test]
    fn conversion_prepends_header_and_rewrites_timestamps() {
        let converted = srt_to_vtt(fixtures::SRT.as_bytes()).unwrap();
        assert!(converted.starts_with("WEBVTT\n\n"));
        assert!(converted.contains("00:00:01.000 --> 00:00:04.000"));
        assert!(converted.contains("00:02:10.500 --> 00:02:12.300"));
        assert!(!converted.contains(','), "no timestamp commas remain");
    }

    #[test]
    fn non_timestamp_content_is_untouched() {
        let source = b"1\n00:00:01,000 --> 00:00:02,000\nWait, what? 12,5 pounds\n";
        let converted = srt_to_vtt(source).unwrap();
        assert!(converted.contains("Wait, what? 12,5 pounds"));
        assert!(converted.contains("00:00:01.000 --> 00:00:02.000"));
    }

    #[test]
    fn empty_source_is_rejected() {
        assert!(matches!(
            srt_to_vtt(b""),
            Err(MediaError::EmptySubtitleSource)
        ));
    }

    #[tokio::test]
    async fn writer_lays_files_out_by_video_and_language() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SubtitleWriter::new(dir.path().to_path_buf());
        let video_id = Uuid::new_v4();

        let path = writer
            .store_srt_as_vtt(video_id, "en", fixtures::SRT.as_bytes())
            .await
            .unwrap();
        assert_eq!(path, dir.path().join(video_id.to_string()).join("en.vtt"));

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.starts_with("WEBVTT\n\n"));
        assert!(!dir
            .path()
            .join(video_id.to_string())
            .join("en.vtt.part")
            .exists());
    }

    #[tokio::test]
    async fn writer_rejects_empty_sources_without_output() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SubtitleWriter::new(dir.path().to_path_buf());
        let video_id = Uuid::new_v4();

        let result = writer.store_srt_as_vtt(video_id, "en", b"").await;
        assert!(result.is_err());
        assert!(!dir.path().join(video_id.to_string()).exists());
    }
}
