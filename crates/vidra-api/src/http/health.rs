//! Liveness endpoint.

use axum::Json;
use serde_json::{Value, json};

/// `GET /health` — allow-listed liveness probe.
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
