use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use kaiwa_threads::Feedback;
use serde::Deserialize;

use crate::app::AppState;
use crate::auth::{authenticate, owned_thread};
use crate::error::{ApiError, ApiResult};

#[derive(Deserialize)]
pub struct FeedbackRequest {
    /// -1, 0 or 1.
    pub value: i64,
    pub comment: Option<String>,
}

/// POST /api/steps/{id}/feedback. Only the thread owner may rate a step.
pub async fn submit(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(step_id): Path<String>,
    Json(req): Json<FeedbackRequest>,
) -> ApiResult<Json<Feedback>> {
    let user = authenticate(&state, &headers)?;
    let step = state
        .threads
        .get_step(&step_id)?
        .ok_or_else(|| ApiError::not_found(format!("step {step_id}")))?;
    owned_thread(&state, &user, &step.thread_id)?;

    let comment = req.comment.as_deref().map(str::trim).filter(|c| !c.is_empty());
    Ok(Json(state.threads.upsert_feedback(&step.id, req.value, comment)?))
}
