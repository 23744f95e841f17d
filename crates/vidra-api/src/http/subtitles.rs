//! Subtitle endpoints: listing, WebVTT retrieval, and SRT upload.

use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use tracing::info;
use uuid::Uuid;
use vidra_data::NewSubtitle;
use vidra_events::Event;
use vidra_media::srt_to_vtt;

use crate::http::errors::ApiError;
use crate::models::SubtitleDto;
use crate::state::ApiState;

/// `GET /streaming/subtitles/{videoId}` — tracks recorded for a video.
pub async fn list_subtitles(
    State(state): State<ApiState>,
    Path(video_id): Path<Uuid>,
) -> Result<Json<Vec<SubtitleDto>>, ApiError> {
    let records = state
        .subtitles
        .list_for_video(video_id)
        .await
        .map_err(|err| ApiError::internal("subtitles.list", &err))?;
    Ok(Json(records.into_iter().map(Into::into).collect()))
}

/// `GET /streaming/subtitles/{videoId}/{lang}` — track content as WebVTT.
pub async fn get_subtitle(
    State(state): State<ApiState>,
    Path((video_id, language)): Path<(Uuid, String)>,
) -> Result<Response, ApiError> {
    let record = state
        .subtitles
        .fetch(video_id, &language)
        .await
        .map_err(|err| ApiError::internal("subtitles.fetch", &err))?
        .ok_or_else(|| {
            ApiError::not_found(format!("no '{language}' subtitle for video {video_id}"))
        })?;

    let raw = tokio::fs::read(&record.file_path)
        .await
        .map_err(|_| ApiError::unavailable("subtitle file missing on disk"))?;
    // stored SRT tracks are transcoded on the way out
    let content = if record.format == "srt" {
        srt_to_vtt(&raw).map_err(|err| ApiError::internal("subtitles.convert", &err))?
    } else {
        String::from_utf8_lossy(&raw).into_owned()
    };

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/vtt; charset=utf-8")],
        content,
    )
        .into_response())
}

/// `POST /streaming/subtitles/{videoId}/{lang}` — store an SRT body as the
/// video's WebVTT track.
pub async fn upload_subtitle(
    State(state): State<ApiState>,
    Path((video_id, language)): Path<(Uuid, String)>,
    body: Bytes,
) -> Result<(StatusCode, Json<SubtitleDto>), ApiError> {
    if language.is_empty() || language.len() > 8 || !language.is_ascii() {
        return Err(ApiError::bad_request("invalid language code"));
    }

    let stored = state
        .subtitle_writer
        .store_srt_as_vtt(video_id, &language, &body)
        .await
        .map_err(|err| ApiError::bad_request(format!("unusable subtitle source: {err}")))?;

    let record = state
        .subtitles
        .upsert(&NewSubtitle {
            id: Uuid::new_v4(),
            video_id,
            language_code: language.clone(),
            file_path: stored.to_string_lossy().into_owned(),
            format: "vtt".to_string(),
            source: Some("upload".to_string()),
        })
        .await
        .map_err(|err| ApiError::internal("subtitles.upsert", &err))?;

    state.events.publish(Event::SubtitleStored {
        video_id,
        language: language.clone(),
    });
    info!(%video_id, language, "subtitle track stored");
    Ok((StatusCode::CREATED, Json(record.into())))
}
