//! Byte-range video streaming, tolerant of still-growing downloads.
//!
//! The file descriptor is acquired once per request; the response body
//! streams from it. For a DOWNLOADING job only the contiguously verified
//! prefix of the primary file is addressable: the handler waits briefly for
//! the requested range to become available and returns 416 otherwise, never
//! serving bytes past the verified prefix.

use std::path::Path;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Path as PathParam, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;
use vidra_cache::StreamGuard;
use vidra_events::JobStatus;

use crate::http::errors::ApiError;
use crate::http::jobs::map_job_error;
use crate::http::range::{RangeError, resolve_range};
use crate::state::ApiState;

/// Budget for a growing file to catch up with the requested range.
const GROWTH_WAIT: Duration = Duration::from_secs(5);
/// Poll cadence while waiting for the verified prefix to advance.
const GROWTH_POLL: Duration = Duration::from_millis(500);

/// `GET /streaming/video/{jobId}` — byte-range capable video stream.
pub async fn stream_video(
    State(state): State<ApiState>,
    PathParam(job_id): PathParam<Uuid>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let job = state.manager.fetch(job_id).await.map_err(map_job_error)?;
    let range_header = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok());

    match &job.status {
        JobStatus::Completed => {
            let (path, size, guard) = match state
                .cache
                .store()
                .fetch_pair(job.video_id, job.torrent_id)
                .await
            {
                Ok(Some(record)) => {
                    let guard = state
                        .cache
                        .open_stream(&record)
                        .await
                        .map_err(|err| ApiError::internal("cache.open_stream", &err))?;
                    let size = u64::try_from(record.file_size).unwrap_or_default();
                    (record.file_path, size, Some(guard))
                }
                Ok(None) => {
                    // completed before the cache record landed; fall back to
                    // the job's recorded artifact
                    let path = job
                        .file_path
                        .clone()
                        .ok_or_else(|| ApiError::unavailable("artifact path unknown"))?;
                    let size = file_size(&path).await?;
                    (path, size, None)
                }
                Err(err) => return Err(ApiError::internal("cache.fetch_pair", &err)),
            };
            serve_file(Path::new(&path), size, range_header, guard).await
        }
        JobStatus::Converting => {
            // fully downloaded; the original file is complete on disk
            let path = job
                .file_path
                .clone()
                .ok_or_else(|| ApiError::unavailable("artifact path unknown"))?;
            let size = file_size(&path).await?;
            serve_file(Path::new(&path), size, range_header, None).await
        }
        JobStatus::Downloading => {
            let path = job
                .file_path
                .clone()
                .ok_or_else(|| ApiError::unavailable("no streamable bytes yet"))?;

            // suffix ranges address the end of the finished file, which a
            // growing download cannot serve
            if range_header.is_some_and(|header| header.starts_with("bytes=-")) {
                return Ok(unsatisfiable_response(job.available_bytes));
            }
            let wanted_start = match range_header {
                // resolve against a placeholder size just to learn the start
                Some(header) => match resolve_range(header, u64::MAX) {
                    Ok((start, _)) => start,
                    Err(RangeError::Malformed) => {
                        return Err(ApiError::bad_request("invalid range header"));
                    }
                    Err(RangeError::Unsatisfiable) => 0,
                },
                None => 0,
            };

            let available = await_available(&state, job_id, wanted_start).await?;
            if available == 0 {
                return Err(ApiError::unavailable("no streamable bytes yet"));
            }
            if wanted_start >= available {
                debug!(%job_id, wanted_start, available, "range beyond verified prefix");
                return Ok(unsatisfiable_response(available));
            }
            serve_file(Path::new(&path), available, range_header, None).await
        }
        JobStatus::Pending => Err(ApiError::unavailable("download has not started yet")),
        JobStatus::Failed { message } => {
            Err(ApiError::unavailable(format!("download failed: {message}")))
        }
        JobStatus::Cancelled => Err(ApiError::unavailable("download was cancelled")),
    }
}

/// Wait (bounded) for the verified prefix to cover `wanted_start`.
async fn await_available(
    state: &ApiState,
    job_id: Uuid,
    wanted_start: u64,
) -> Result<u64, ApiError> {
    let deadline = tokio::time::Instant::now() + GROWTH_WAIT;
    loop {
        let job = state.manager.fetch(job_id).await.map_err(map_job_error)?;
        let available = job.available_bytes;
        if available > wanted_start
            || !matches!(job.status, JobStatus::Downloading)
            || tokio::time::Instant::now() >= deadline
        {
            return Ok(available);
        }
        tokio::time::sleep(GROWTH_POLL).await;
    }
}

/// Serve `[0, size)` of the file at `path`, honouring an optional range
/// header. The optional cache guard rides along with the body so eviction
/// waits for the last byte.
pub(crate) async fn serve_file(
    path: &Path,
    size: u64,
    range_header: Option<&str>,
    guard: Option<StreamGuard>,
) -> Result<Response, ApiError> {
    let span = match range_header {
        None => None,
        Some(header) => match resolve_range(header, size) {
            Ok(span) => Some(span),
            Err(RangeError::Malformed) => {
                return Err(ApiError::bad_request("invalid range header"));
            }
            Err(RangeError::Unsatisfiable) => return Ok(unsatisfiable_response(size)),
        },
    };

    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|err| ApiError::internal("stream.open", &err))?;

    let (start, end) = span.unwrap_or((0, size.saturating_sub(1)));
    let content_length = if size == 0 { 0 } else { end - start + 1 };
    if start > 0 {
        file.seek(std::io::SeekFrom::Start(start))
            .await
            .map_err(|err| ApiError::internal("stream.seek", &err))?;
    }

    let reader = file.take(content_length);
    let stream = ReaderStream::new(reader).map(move |chunk| {
        // the guard lives as long as the body does
        let _reader_guard = &guard;
        chunk
    });

    let mut builder = Response::builder()
        .status(if span.is_some() {
            StatusCode::PARTIAL_CONTENT
        } else {
            StatusCode::OK
        })
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_TYPE, content_type_for(path))
        .header(header::CONTENT_LENGTH, content_length);
    if span.is_some() {
        builder = builder.header(
            header::CONTENT_RANGE,
            format!("bytes {start}-{end}/{size}"),
        );
    }
    builder
        .body(Body::from_stream(stream))
        .map_err(|err| ApiError::internal("stream.body", &err))
}

fn unsatisfiable_response(size: u64) -> Response {
    let mut response = ApiError::range_not_satisfiable().into_response();
    if let Ok(value) = HeaderValue::from_str(&format!("bytes */{size}")) {
        response.headers_mut().insert(header::CONTENT_RANGE, value);
    }
    response
}

async fn file_size(path: &str) -> Result<u64, ApiError> {
    tokio::fs::metadata(path)
        .await
        .map(|metadata| metadata.len())
        .map_err(|_| ApiError::unavailable("artifact missing on disk"))
}

fn content_type_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("mp4" | "m4v") => "video/mp4",
        Some("mkv") => "video/x-matroska",
        Some("webm") => "video/webm",
        Some("avi") => "video/x-msvideo",
        Some("mov") => "video/quicktime",
        Some("ts") => "video/mp2t",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::IntoResponse;

    async fn fixture_file(len: usize) -> (tempfile::TempDir, std::path::PathBuf, Vec<u8>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feature.mp4");
        let content: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
        tokio::fs::write(&path, &content).await.unwrap();
        (dir, path, content)
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    #[tokio::test]
    async fn bounded_range_returns_partial_content() {
        let (_dir, path, content) = fixture_file(1_000).await;
        let response = serve_file(&path, 1_000, Some("bytes=100-199"), None)
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(
            response.headers().get(header::CONTENT_RANGE).unwrap(),
            "bytes 100-199/1000"
        );
        assert_eq!(response.headers().get(header::CONTENT_LENGTH).unwrap(), "100");
        assert_eq!(
            response.headers().get(header::ACCEPT_RANGES).unwrap(),
            "bytes"
        );
        assert_eq!(body_bytes(response).await, content[100..200].to_vec());
    }

    #[tokio::test]
    async fn suffix_range_serves_the_tail() {
        let (_dir, path, content) = fixture_file(1_000).await;
        let response = serve_file(&path, 1_000, Some("bytes=-50"), None)
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(
            response.headers().get(header::CONTENT_RANGE).unwrap(),
            "bytes 950-999/1000"
        );
        assert_eq!(body_bytes(response).await, content[950..].to_vec());
    }

    #[tokio::test]
    async fn past_the_end_is_416_with_total_size() {
        let (_dir, path, _) = fixture_file(1_000).await;
        let response = serve_file(&path, 1_000, Some("bytes=2000-"), None)
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(
            response.headers().get(header::CONTENT_RANGE).unwrap(),
            "bytes */1000"
        );
    }

    #[tokio::test]
    async fn no_range_serves_the_whole_file() {
        let (_dir, path, content) = fixture_file(256).await;
        let response = serve_file(&path, 256, None, None).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get(header::CONTENT_LENGTH).unwrap(), "256");
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "video/mp4"
        );
        assert_eq!(body_bytes(response).await, content);
    }

    #[tokio::test]
    async fn malformed_range_is_a_bad_request() {
        let (_dir, path, _) = fixture_file(16).await;
        let err = serve_file(&path, 16, Some("bytes=5-1"), None)
            .await
            .expect_err("malformed range must fail");
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn content_types_follow_extensions() {
        assert_eq!(content_type_for(Path::new("a.MKV")), "video/x-matroska");
        assert_eq!(content_type_for(Path::new("a.webm")), "video/webm");
        assert_eq!(content_type_for(Path::new("a.bin")), "application/octet-stream");
    }
}
