use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;

use crate::app::AppState;

/// GET /api/health: database liveness check. No auth.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    match state.threads.ping() {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "database": "connected",
            })),
        ),
        Err(e) => {
            warn!(error = %e, "health check failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "status": "error",
                    "database": "disconnected",
                    "error": e.to_string(),
                })),
            )
        }
    }
}
