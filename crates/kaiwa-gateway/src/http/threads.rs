use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use kaiwa_core::config::ChatMode;
use kaiwa_core::turn::ChatTurn;
use kaiwa_threads::{Element, Step, Thread};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::app::AppState;
use crate::auth::{authenticate, owned_thread};
use crate::error::{ApiError, ApiResult};

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

#[derive(Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
}

pub async fn list(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<Thread>>> {
    let user = authenticate(&state, &headers)?;
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIST_LIMIT);
    Ok(Json(state.threads.list_for_user(&user.id, limit)?))
}

#[derive(Deserialize, Default)]
pub struct CreateRequest {
    pub name: Option<String>,
}

/// POST /api/threads. In completions mode the configured greeting becomes
/// the first step, so it is replayed with the rest of the history.
pub async fn create(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Option<Json<CreateRequest>>,
) -> ApiResult<(StatusCode, Json<Thread>)> {
    let user = authenticate(&state, &headers)?;
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let thread = state
        .threads
        .create_thread(&user.id, &user.identifier, req.name.as_deref())?;

    let greeting = &state.config.chat.greeting;
    if state.config.chat.mode == ChatMode::Completions && !greeting.is_empty() {
        state
            .threads
            .append_turns(&thread.id, &[ChatTurn::assistant(greeting.clone())])?;
    }
    info!(thread = %thread.id, user = %user.id, "thread created");
    Ok((StatusCode::CREATED, Json(thread)))
}

#[derive(Serialize)]
pub struct ThreadDetail {
    pub thread: Thread,
    pub steps: Vec<Step>,
    pub elements: Vec<Element>,
}

pub async fn get(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<ThreadDetail>> {
    let user = authenticate(&state, &headers)?;
    let thread = owned_thread(&state, &user, &id)?;
    Ok(Json(ThreadDetail {
        steps: state.threads.list_steps(&thread.id)?,
        elements: state.threads.list_elements(&thread.id)?,
        thread,
    }))
}

#[derive(Deserialize)]
pub struct RenameRequest {
    pub name: String,
}

pub async fn rename(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<RenameRequest>,
) -> ApiResult<Json<Thread>> {
    let user = authenticate(&state, &headers)?;
    let thread = owned_thread(&state, &user, &id)?;
    let name = req.name.trim();
    if name.is_empty() {
        return Err(ApiError::bad_request("name cannot be empty"));
    }
    state.threads.rename(&thread.id, name)?;
    let renamed = state
        .threads
        .get(&thread.id)?
        .ok_or_else(|| ApiError::not_found(format!("thread {}", thread.id)))?;
    Ok(Json(renamed))
}

pub async fn delete(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let user = authenticate(&state, &headers)?;
    let thread = owned_thread(&state, &user, &id)?;
    state.sessions.remove(&thread.id);
    state.threads.delete(&thread.id)?;
    info!(thread = %thread.id, "thread deleted");
    Ok(StatusCode::NO_CONTENT)
}
