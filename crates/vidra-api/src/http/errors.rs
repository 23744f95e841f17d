//! Structured API errors mapped to problem-detail responses.

use std::time::Duration;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::error;

use crate::http::rate_limit::insert_rate_limit_headers;
use crate::models::ProblemDetails;

/// Structured API error carrying an RFC 9457-style body.
#[derive(Debug)]
pub struct ApiError {
    pub(crate) status: StatusCode,
    kind: &'static str,
    title: &'static str,
    detail: Option<String>,
    rate_limit: Option<RateLimitContext>,
}

#[derive(Debug)]
struct RateLimitContext {
    limit: u32,
    retry_after: Option<Duration>,
}

impl ApiError {
    const fn new(status: StatusCode, kind: &'static str, title: &'static str) -> Self {
        Self {
            status,
            kind,
            title,
            detail: None,
            rate_limit: None,
        }
    }

    pub(crate) fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Malformed input: bad magnet URIs, invalid ranges, unknown job ids.
    pub(crate) fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", "bad request").with_detail(detail)
    }

    /// Missing, invalid, or expired credentials.
    pub(crate) fn unauthorized(detail: impl Into<String>) -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "authentication required",
        )
        .with_detail(detail)
    }

    /// A resource that genuinely does not exist (subtitle tracks).
    pub(crate) fn not_found(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", "resource not found").with_detail(detail)
    }

    /// A conflicting lifecycle operation (e.g. cancelling a finished job).
    pub(crate) fn conflict(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "conflict", "conflict").with_detail(detail)
    }

    /// Rate limits and other exhausted budgets.
    pub(crate) fn resource_exhausted(detail: impl Into<String>) -> Self {
        Self::new(
            StatusCode::TOO_MANY_REQUESTS,
            "resource_exhausted",
            "rate limit exceeded",
        )
        .with_detail(detail)
    }

    /// The artifact or service is not currently available.
    pub(crate) fn unavailable(detail: impl Into<String>) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "unavailable",
            "service unavailable",
        )
        .with_detail(detail)
    }

    /// Range not satisfiable; the caller attaches `Content-Range` itself.
    pub(crate) fn range_not_satisfiable() -> Self {
        Self::new(
            StatusCode::RANGE_NOT_SATISFIABLE,
            "range_not_satisfiable",
            "requested range not satisfiable",
        )
    }

    /// Unexpected condition; the cause is logged, never leaked.
    pub(crate) fn internal(context: &'static str, err: &dyn std::fmt::Display) -> Self {
        error!(context, error = %err, "internal error");
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal",
            "internal server error",
        )
        .with_detail("an unexpected condition occurred")
    }

    pub(crate) const fn with_rate_limit(mut self, limit: u32, retry_after: Option<Duration>) -> Self {
        self.rate_limit = Some(RateLimitContext { limit, retry_after });
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ProblemDetails {
            kind: self.kind.to_string(),
            title: self.title.to_string(),
            status: self.status.as_u16(),
            detail: self.detail,
        };
        let mut response = (self.status, Json(body)).into_response();
        if let Some(rate) = self.rate_limit {
            insert_rate_limit_headers(response.headers_mut(), rate.limit, 0, rate.retry_after);
        }
        response
    }
}
