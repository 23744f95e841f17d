//! ffmpeg/ffprobe gateway.
//!
//! Browsers get MP4/H.264; everything else is rewrapped or transcoded. The
//! output file is written under a `.part` suffix and renamed only on success,
//! so a completed path on disk always means a complete file.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{MediaError, Result};

/// Facts about a media file gathered via ffprobe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaInfo {
    /// Container format name (e.g. `mov,mp4,m4a,3gp,3g2,mj2`).
    pub format: Option<String>,
    /// Codec of the first video stream (e.g. `h264`).
    pub video_codec: Option<String>,
    /// Resolution of the first video stream (e.g. `1920x1080`).
    pub resolution: Option<String>,
    /// Duration in whole seconds.
    pub duration_seconds: Option<u64>,
    /// Overall bitrate in bits per second.
    pub bitrate: Option<u64>,
}

impl MediaInfo {
    /// Whether the file must be converted before browsers can play it:
    /// anything that is not H.264 video in an MP4 container.
    #[must_use]
    pub fn needs_conversion(&self) -> bool {
        let mp4 = self
            .format
            .as_deref()
            .is_some_and(|format| format.split(',').any(|name| name.trim() == "mp4"));
        let h264 = self
            .video_codec
            .as_deref()
            .is_some_and(|codec| codec.eq_ignore_ascii_case("h264"));
        !(mp4 && h264)
    }
}

/// Gateway to the external media tools.
#[derive(Debug, Clone)]
pub struct Transcoder {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl Transcoder {
    /// A gateway using the given tool paths.
    #[must_use]
    pub const fn new(ffmpeg: PathBuf, ffprobe: PathBuf) -> Self {
        Self { ffmpeg, ffprobe }
    }

    /// Probe container/codec/duration facts for a file.
    ///
    /// # Errors
    ///
    /// Fails when ffprobe cannot be launched, exits unsuccessfully, or
    /// produces unparseable output.
    pub async fn probe(&self, input: &Path) -> Result<MediaInfo> {
        let output = Command::new(&self.ffprobe)
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
            ])
            .arg(input)
            .stdin(Stdio::null())
            .output()
            .await?;
        if !output.status.success() {
            return Err(MediaError::ProbeFailed {
                status: output.status,
            });
        }
        let document: Value = serde_json::from_slice(&output.stdout)?;
        Ok(parse_probe_output(&document))
    }

    /// Whether the file needs conversion before browsers can play it.
    ///
    /// # Errors
    ///
    /// Propagates probe failures.
    pub async fn needs_conversion(&self, input: &Path) -> Result<bool> {
        Ok(self.probe(input).await?.needs_conversion())
    }

    /// Convert `input` into an MP4/H.264-baseline file at `output`.
    ///
    /// Returns whether the conversion succeeded; on failure any partial
    /// output is removed and `output` is left untouched.
    ///
    /// # Errors
    ///
    /// Fails only when the tool cannot be launched or the filesystem
    /// misbehaves; an unsuccessful ffmpeg run is a `false` return.
    pub async fn convert(&self, input: &Path, output: &Path) -> Result<bool> {
        let staging = staging_path(output);
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        debug!(input = %input.display(), output = %output.display(), "starting conversion");
        let status = Command::new(&self.ffmpeg)
            .arg("-y")
            .arg("-i")
            .arg(input)
            .args([
                "-c:v",
                "libx264",
                "-profile:v",
                "baseline",
                "-level",
                "3.0",
                "-pix_fmt",
                "yuv420p",
                "-c:a",
                "aac",
                "-movflags",
                "+faststart",
            ])
            .arg(&staging)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;

        if status.success() {
            tokio::fs::rename(&staging, output).await?;
            Ok(true)
        } else {
            warn!(input = %input.display(), %status, "conversion failed");
            let _ = tokio::fs::remove_file(&staging).await;
            Ok(false)
        }
    }
}

fn staging_path(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

fn parse_probe_output(document: &Value) -> MediaInfo {
    let format = document
        .get("format")
        .and_then(|format| format.get("format_name"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let duration_seconds = document
        .get("format")
        .and_then(|format| format.get("duration"))
        .and_then(Value::as_str)
        .and_then(|duration| duration.parse::<f64>().ok())
        .map(|duration| duration.max(0.0) as u64);
    let bitrate = document
        .get("format")
        .and_then(|format| format.get("bit_rate"))
        .and_then(Value::as_str)
        .and_then(|rate| rate.parse::<u64>().ok());

    let video_stream = document
        .get("streams")
        .and_then(Value::as_array)
        .and_then(|streams| {
            streams.iter().find(|stream| {
                stream.get("codec_type").and_then(Value::as_str) == Some("video")
            })
        });
    let video_codec = video_stream
        .and_then(|stream| stream.get("codec_name"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let resolution = video_stream.and_then(|stream| {
        let width = stream.get("width").and_then(Value::as_u64)?;
        let height = stream.get("height").and_then(Value::as_u64)?;
        Some(format!("{width}x{height}"))
    });

    MediaInfo {
        format,
        video_codec,
        resolution,
        duration_seconds,
        bitrate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn probe_document(format: &str, codec: &str) -> Value {
        json!({
            "format": {
                "format_name": format,
                "duration": "5400.120000",
                "bit_rate": "2000000"
            },
            "streams": [
                {"codec_type": "audio", "codec_name": "aac"},
                {"codec_type": "video", "codec_name": codec, "width": 1920, "height": 1080}
            ]
        })
    }

    #[test]
    fn parses_ffprobe_json() {
        let info = parse_probe_output(&probe_document("mov,mp4,m4a,3gp,3g2,mj2", "h264"));
        assert_eq!(info.video_codec.as_deref(), Some("h264"));
        assert_eq!(info.resolution.as_deref(), Some("1920x1080"));
        assert_eq!(info.duration_seconds, Some(5400));
        assert_eq!(info.bitrate, Some(2_000_000));
    }

    #[test]
    fn mp4_h264_skips_conversion() {
        let info = parse_probe_output(&probe_document("mov,mp4,m4a,3gp,3g2,mj2", "h264"));
        assert!(!info.needs_conversion());
    }

    #[test]
    fn other_containers_and_codecs_convert() {
        let matroska = parse_probe_output(&probe_document("matroska,webm", "h264"));
        assert!(matroska.needs_conversion());

        let hevc_mp4 = parse_probe_output(&probe_document("mov,mp4,m4a,3gp,3g2,mj2", "hevc"));
        assert!(hevc_mp4.needs_conversion());

        assert!(MediaInfo::default().needs_conversion(), "unknown media converts");
    }

    #[test]
    fn staging_path_appends_part_suffix() {
        assert_eq!(
            staging_path(Path::new("/tmp/out/feature.mp4")),
            PathBuf::from("/tmp/out/feature.mp4.part")
        );
    }
}
