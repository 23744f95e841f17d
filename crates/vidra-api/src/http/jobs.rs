//! Job lifecycle endpoints.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use tracing::info;
use uuid::Uuid;
use vidra_jobs::{InitiateRequest, JobError};

use crate::http::errors::ApiError;
use crate::models::{CacheStatsDto, DownloadJobDto, DownloadRequest, ReadyDto};
use crate::state::ApiState;

/// Map job-layer failures onto client-visible error kinds. Unknown job ids
/// are client mistakes, not missing resources.
pub(crate) fn map_job_error(err: JobError) -> ApiError {
    match err {
        JobError::InvalidMagnet { reason } => {
            ApiError::bad_request(format!("malformed magnet URI: {reason}"))
        }
        JobError::NotFound(id) => ApiError::bad_request(format!("unknown job id {id}")),
        JobError::IllegalTransition { from, to, .. } => {
            ApiError::conflict(format!("job is '{from}' and cannot move to '{to}'"))
        }
        JobError::Message(err) => ApiError::internal("jobs.message", &err),
        JobError::Data(err) => ApiError::internal("jobs.data", &err),
    }
}

/// `POST /streaming/download` — idempotent initiation per `(video, user)`.
pub async fn initiate_download(
    State(state): State<ApiState>,
    Json(request): Json<DownloadRequest>,
) -> Result<(StatusCode, Json<DownloadJobDto>), ApiError> {
    let initiate = InitiateRequest {
        video_id: request.video_id,
        torrent_id: request.torrent_id,
        user_id: request.user_id,
        magnet_uri: request.magnet_link,
        priority: request.priority.clamp(1, 10),
    };
    let (record, created) = state
        .manager
        .initiate(initiate)
        .await
        .map_err(map_job_error)?;
    info!(job_id = %record.id, created, "download initiation handled");
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(record.into())))
}

/// `GET /streaming/jobs/{id}` — the full job representation.
pub async fn get_job(
    State(state): State<ApiState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<DownloadJobDto>, ApiError> {
    let record = state.manager.fetch(job_id).await.map_err(map_job_error)?;
    Ok(Json(record.into()))
}

/// `GET /streaming/jobs/{id}/ready` — idempotent readiness probe.
pub async fn job_ready(
    State(state): State<ApiState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<ReadyDto>, ApiError> {
    let record = state.manager.fetch(job_id).await.map_err(map_job_error)?;
    Ok(Json(record.into()))
}

/// `GET /streaming/jobs` — every job, newest first.
pub async fn list_jobs(
    State(state): State<ApiState>,
) -> Result<Json<Vec<DownloadJobDto>>, ApiError> {
    let records = state
        .manager
        .jobs()
        .list_all()
        .await
        .map_err(|err| ApiError::internal("jobs.list_all", &err))?;
    Ok(Json(records.into_iter().map(Into::into).collect()))
}

/// `GET /streaming/jobs/user/{userId}` — one user's jobs, newest first.
pub async fn list_user_jobs(
    State(state): State<ApiState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<Vec<DownloadJobDto>>, ApiError> {
    let records = state
        .manager
        .jobs()
        .list_for_user(user_id)
        .await
        .map_err(|err| ApiError::internal("jobs.list_for_user", &err))?;
    Ok(Json(records.into_iter().map(Into::into).collect()))
}

/// `DELETE /streaming/jobs/{id}` — cancel a pending or downloading job.
pub async fn cancel_job(
    State(state): State<ApiState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<DownloadJobDto>, ApiError> {
    let record = state.manager.cancel(job_id).await.map_err(map_job_error)?;
    info!(%job_id, "job cancelled via API");
    Ok(Json(record.into()))
}

/// `GET /streaming/cache/stats` — cache occupancy.
pub async fn cache_stats(
    State(state): State<ApiState>,
) -> Result<Json<CacheStatsDto>, ApiError> {
    let stats = state
        .cache
        .stats()
        .await
        .map_err(|err| ApiError::internal("cache.stats", &err))?;
    Ok(Json(CacheStatsDto::from_stats(stats, state.cache.max_bytes())))
}
