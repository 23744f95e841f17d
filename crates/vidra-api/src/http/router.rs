//! Router construction and server host for the API.

use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    Router,
    http::{Method, Request, header::CONTENT_TYPE},
    middleware,
    routing::{get, post},
};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::Span;

use crate::http::auth::require_bearer;
use crate::http::health::health;
use crate::http::jobs::{
    cache_stats, cancel_job, get_job, initiate_download, job_ready, list_jobs, list_user_jobs,
};
use crate::http::stream::stream_video;
use crate::http::subtitles::{get_subtitle, list_subtitles, upload_subtitle};
use crate::state::ApiState;

/// Axum router wrapper that hosts the Vidra API.
pub struct ApiServer {
    router: Router,
}

impl ApiServer {
    /// Construct the server with shared dependencies wired through state.
    #[must_use]
    pub fn new(state: ApiState) -> Self {
        let cors_layer = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
            .allow_headers([CONTENT_TYPE]);

        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(|request: &Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                tracing::info_span!(
                    "http.request",
                    method = %request.method(),
                    route = %request.uri().path(),
                    request_id = %request_id,
                    status_code = tracing::field::Empty,
                    latency_ms = tracing::field::Empty,
                )
            })
            .on_response(
                |response: &axum::response::Response, latency: Duration, span: &Span| {
                    span.record("status_code", response.status().as_u16());
                    span.record(
                        "latency_ms",
                        u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
                    );
                },
            );

        let layered = ServiceBuilder::new()
            .layer(vidra_telemetry::propagate_request_id_layer())
            .layer(vidra_telemetry::set_request_id_layer())
            .layer(trace_layer);

        let auth_layer = middleware::from_fn_with_state(state.auth.clone(), require_bearer);

        let router = Self::routes()
            .layer(auth_layer)
            .layer(cors_layer)
            .layer(layered)
            .with_state(state);

        Self { router }
    }

    fn routes() -> Router<ApiState> {
        Router::new()
            .route("/health", get(health))
            .route("/streaming/download", post(initiate_download))
            .route("/streaming/jobs", get(list_jobs))
            .route("/streaming/jobs/{id}", get(get_job).delete(cancel_job))
            .route("/streaming/jobs/{id}/ready", get(job_ready))
            .route("/streaming/jobs/user/{user_id}", get(list_user_jobs))
            .route("/streaming/video/{job_id}", get(stream_video))
            .route("/streaming/subtitles/{video_id}", get(list_subtitles))
            .route(
                "/streaming/subtitles/{video_id}/{lang}",
                get(get_subtitle).post(upload_subtitle),
            )
            .route("/streaming/cache/stats", get(cache_stats))
    }

    /// Serve the API on the supplied address until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener fails to bind or the server
    /// terminates unexpectedly.
    pub async fn serve(self, addr: SocketAddr) -> std::io::Result<()> {
        tracing::info!(%addr, "starting API listener");
        let listener = TcpListener::bind(addr).await?;
        axum::serve(
            listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
    }

    /// The underlying router, for in-process testing.
    #[must_use]
    pub fn into_router(self) -> Router {
        self.router
    }
}
