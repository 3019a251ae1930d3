//! POST /api/threads/{id}/files?name=report.csv
//!
//! Raw request body, `content-type` header as the MIME type. The file lands
//! in blob storage as a thread element; in assistants mode it is also
//! uploaded to the provider and attached to the next message.
//!
//! GET /files/{thread}/... serves local blobs to the thread's owner only.

use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{header, HeaderMap, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use kaiwa_agent::assistants::Attachment;
use kaiwa_core::config::MAX_UPLOAD_BYTES;
use kaiwa_core::error::KaiwaError;
use kaiwa_threads::{Element, NewElement};
use serde::Deserialize;
use tracing::info;

use crate::app::{AppState, ChatBackend};
use crate::auth::{authenticate, owned_thread};
use crate::error::{ApiError, ApiResult};

#[derive(Deserialize)]
pub struct UploadQuery {
    pub name: String,
}

pub async fn upload(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<UploadQuery>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<Element>)> {
    let user = authenticate(&state, &headers)?;
    let thread = owned_thread(&state, &user, &id)?;

    let name = query.name.trim();
    if name.is_empty() {
        return Err(ApiError::bad_request("file name cannot be empty"));
    }
    if body.is_empty() {
        return Err(ApiError::bad_request("file is empty"));
    }
    if body.len() > MAX_UPLOAD_BYTES {
        return Err(ApiError(KaiwaError::PayloadTooLarge {
            size: body.len(),
            max: MAX_UPLOAD_BYTES,
        }));
    }
    let mime = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();

    if let ChatBackend::Assistants { poller, .. } = &state.chat {
        let live = state
            .sessions
            .get_or_load(&thread, &state.threads, &state.config.chat)?;
        let file_id = poller.api().upload_file(name, body.to_vec(), &mime).await?;
        live.queue_attachment(Attachment {
            file_id,
            mime: mime.clone(),
        });
    }

    let key = kaiwa_storage::object_key(&thread.id, name);
    let size = body.len() as i64;
    let stored = state.storage.upload(&key, body.to_vec(), &mime).await?;
    let element = state.threads.add_element(NewElement {
        thread_id: thread.id.clone(),
        step_id: None,
        name: name.to_string(),
        mime,
        object_key: stored.key,
        url: stored.url,
        size,
    })?;
    info!(thread = %thread.id, element = %element.id, size, "file uploaded");
    Ok((StatusCode::CREATED, Json(element)))
}

/// Gate in front of the local file server: the caller must be signed in
/// and own the thread named by the first path segment.
pub async fn require_file_access(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let thread_id = req
        .uri()
        .path()
        .trim_start_matches('/')
        .split('/')
        .next()
        .unwrap_or_default()
        .to_string();
    let allowed = authenticate(&state, req.headers()).and_then(|user| owned_thread(&state, &user, &thread_id));
    match allowed {
        Ok(_) => next.run(req).await,
        Err(e) => e.into_response(),
    }
}
