//! POST /api/threads/{id}/messages: one user turn, streamed back as SSE.
//!
//! Request: `{"content": "hello"}`
//! Events:  one JSON `TurnEvent` per `data:` line (`token`, `tool_started`,
//!          `tool_output`, `tool_finished`, `error`, `done`).
//!
//! The turn runs in its own task holding the session lock, so a client that
//! disconnects mid-stream cancels through the closed channel while the
//! committed turns are still persisted.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures_util::Stream;
use kaiwa_agent::assistants::{Annotation, RunPoller, RunReport, RunToolCall};
use kaiwa_agent::session::SessionContext;
use kaiwa_agent::turn::TurnEvent;
use kaiwa_core::error::KaiwaError;
use kaiwa_core::turn::ChatTurn;
use kaiwa_threads::{NewElement, Thread};
use serde::Deserialize;
use tokio::sync::{mpsc, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::app::{AppState, ChatBackend};
use crate::auth::{authenticate, owned_thread};
use crate::error::{ApiError, ApiResult};
use crate::sessions::LiveSession;

const EVENT_BUFFER: usize = 64;

#[derive(Deserialize)]
pub struct MessageRequest {
    pub content: String,
}

pub async fn post_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<MessageRequest>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let user = authenticate(&state, &headers)?;
    let thread = owned_thread(&state, &user, &id)?;
    if req.content.trim().is_empty() {
        return Err(ApiError::bad_request("content cannot be empty"));
    }

    let live = state
        .sessions
        .get_or_load(&thread, &state.threads, &state.config.chat)?;
    let session = Arc::clone(&live.ctx).try_lock_owned().map_err(|_| {
        ApiError(KaiwaError::SessionBusy {
            thread_id: thread.id.clone(),
        })
    })?;
    let cancel = live.begin_turn();

    let (tx, mut rx) = mpsc::channel::<TurnEvent>(EVENT_BUFFER);
    let task_state = Arc::clone(&state);
    tokio::spawn(async move {
        run_turn(task_state, thread, live, session, req.content, cancel, tx).await;
    });

    let stream = async_stream::stream! {
        while let Some(event) = rx.recv().await {
            let json = serde_json::to_string(&event).unwrap_or_default();
            yield Ok(Event::default().data(json));
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// POST /api/threads/{id}/stop: cancel the running turn, if any.
pub async fn stop(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let user = authenticate(&state, &headers)?;
    let thread = owned_thread(&state, &user, &id)?;
    let stopped = match state.sessions.get(&thread.id) {
        Some(live) => {
            live.stop();
            true
        }
        None => false,
    };
    Ok((StatusCode::OK, Json(serde_json::json!({ "stopped": stopped }))))
}

async fn run_turn(
    state: Arc<AppState>,
    thread: Thread,
    live: Arc<LiveSession>,
    mut session: OwnedMutexGuard<SessionContext>,
    content: String,
    cancel: CancellationToken,
    tx: mpsc::Sender<TurnEvent>,
) {
    match &state.chat {
        ChatBackend::Completions { controller, tools } => {
            let start = session.history.len();
            let result = controller
                .run_turn(&mut session, &content, tools, &tx, &cancel)
                .await;
            if let Err(e) = &result {
                debug!(thread = %thread.id, error = %e, "completions turn failed");
            }
            // Failed turns still committed the user turn and any finished
            // tool rounds; the store must match the live history.
            persist(&state, &thread.id, session.history.since(start), &tx).await;
        }
        ChatBackend::Assistants {
            poller,
            assistant_id,
        } => {
            let had_provider_thread = session.provider_thread_id.is_some();
            let attachments = live.take_attachments();
            let result = poller
                .run_turn(&mut session, assistant_id, &content, &attachments, &cancel)
                .await;

            if !had_provider_thread {
                if let Some(provider_thread) = &session.provider_thread_id {
                    if let Err(e) = state.threads.set_provider_thread(&thread.id, provider_thread) {
                        warn!(thread = %thread.id, error = %e, "saving provider thread failed");
                    }
                }
            }

            match result {
                Ok(report) => {
                    finish_assistant_turn(&state, poller, &thread, &mut session, &content, report, &tx)
                        .await;
                }
                Err(e) => {
                    warn!(thread = %thread.id, error = %e, "assistant run failed");
                    live.restore_attachments(attachments);
                    let _ = tx
                        .send(TurnEvent::Error {
                            message: e.to_string(),
                        })
                        .await;
                }
            }
        }
    }
}

async fn persist(state: &AppState, thread_id: &str, turns: &[ChatTurn], tx: &mpsc::Sender<TurnEvent>) {
    if turns.is_empty() {
        return;
    }
    if let Err(e) = state.threads.append_turns(thread_id, turns) {
        warn!(thread = %thread_id, error = %e, "persisting turn failed");
        let _ = tx
            .send(TurnEvent::Error {
                message: format!("conversation could not be saved: {e}"),
            })
            .await;
    }
}

/// A file the assistant produced, copied into blob storage.
struct GeneratedFile {
    name: String,
    mime: String,
    key: String,
    url: String,
    size: i64,
}

/// Replay the tools a finished run used as tool events.
async fn emit_tool_calls(calls: Vec<RunToolCall>, tx: &mpsc::Sender<TurnEvent>) {
    for call in calls {
        let _ = tx
            .send(TurnEvent::ToolStarted {
                id: call.id.clone(),
                name: call.name.clone(),
            })
            .await;
        if call.input.is_some() || call.output.is_some() {
            let _ = tx
                .send(TurnEvent::ToolOutput {
                    id: call.id.clone(),
                    input: call.input,
                    output: call.output,
                })
                .await;
        }
        let _ = tx
            .send(TurnEvent::ToolFinished {
                id: call.id,
                name: call.name,
                is_error: call.failed,
            })
            .await;
    }
}

/// Copy generated files into blob storage, rewrite sandbox links to the
/// stored URLs, persist the exchange and stream the answer.
///
/// The session history receives the rewritten answer, the same text the
/// store gets.
async fn finish_assistant_turn(
    state: &AppState,
    poller: &RunPoller,
    thread: &Thread,
    session: &mut SessionContext,
    content: &str,
    report: RunReport,
    tx: &mpsc::Sender<TurnEvent>,
) {
    let RunReport {
        message,
        tool_calls,
        usage,
    } = report;
    emit_tool_calls(tool_calls, tx).await;

    let mut files = Vec::new();
    let mut replacements = Vec::new();

    for annotation in &message.annotations {
        let Annotation::FilePath { text, file_id } = annotation else {
            continue;
        };
        let name = sandbox_file_name(text, file_id);
        match store_generated(state, poller, &thread.id, file_id, &name).await {
            Ok(file) => {
                replacements.push((text.clone(), file.url.clone()));
                files.push(file);
            }
            Err(e) => warn!(file_id = %file_id, error = %e, "copying generated file failed"),
        }
    }

    let mut answer = message.rewrite_annotations(&replacements);
    for file_id in &message.image_file_ids {
        let name = format!("{file_id}.png");
        match store_generated(state, poller, &thread.id, file_id, &name).await {
            Ok(file) => {
                answer.push_str(&format!("\n\n![{}]({})", file.name, file.url));
                files.push(file);
            }
            Err(e) => warn!(file_id = %file_id, error = %e, "copying generated image failed"),
        }
    }

    poller.commit_turn(session, content, &answer);
    let turns = [ChatTurn::user(content), ChatTurn::assistant(answer.clone())];
    match state.threads.append_turns(&thread.id, &turns) {
        Ok(steps) => {
            let step_id = steps.last().map(|s| s.id.clone());
            for file in files {
                let added = state.threads.add_element(NewElement {
                    thread_id: thread.id.clone(),
                    step_id: step_id.clone(),
                    name: file.name,
                    mime: file.mime,
                    object_key: file.key,
                    url: file.url,
                    size: file.size,
                });
                if let Err(e) = added {
                    warn!(thread = %thread.id, error = %e, "recording generated file failed");
                }
            }
        }
        Err(e) => {
            warn!(thread = %thread.id, error = %e, "persisting turn failed");
            let _ = tx
                .send(TurnEvent::Error {
                    message: format!("conversation could not be saved: {e}"),
                })
                .await;
        }
    }

    let _ = tx.send(TurnEvent::Token { text: answer }).await;
    let _ = tx
        .send(TurnEvent::Done {
            model: state.config.provider.model.clone(),
            tokens_in: usage.prompt_tokens,
            tokens_out: usage.completion_tokens,
        })
        .await;
}

async fn store_generated(
    state: &AppState,
    poller: &RunPoller,
    thread_id: &str,
    file_id: &str,
    name: &str,
) -> ApiResult<GeneratedFile> {
    let bytes = poller.api().file_content(file_id).await?;
    let mime = mime_for(name).to_string();
    let size = bytes.len() as i64;
    let key = kaiwa_storage::object_key(thread_id, name);
    let stored = state.storage.upload(&key, bytes, &mime).await?;
    Ok(GeneratedFile {
        name: name.to_string(),
        mime,
        key: stored.key,
        url: stored.url,
        size,
    })
}

/// `sandbox:/mnt/data/chart.png` -> `chart.png`; falls back to the file id.
fn sandbox_file_name(text: &str, file_id: &str) -> String {
    text.rsplit('/')
        .next()
        .map(|s| s.trim_end_matches(')'))
        .filter(|s| !s.is_empty() && !s.starts_with("sandbox:"))
        .map(str::to_string)
        .unwrap_or_else(|| file_id.to_string())
}

fn mime_for(name: &str) -> &'static str {
    let ext = name.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("csv") => "text/csv",
        Some("txt") => "text/plain",
        Some("md") => "text/markdown",
        Some("json") => "application/json",
        Some("pdf") => "application/pdf",
        Some("xlsx") => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_names() {
        assert_eq!(sandbox_file_name("sandbox:/mnt/data/chart.png", "file-1"), "chart.png");
        assert_eq!(sandbox_file_name("sandbox:", "file-1"), "file-1");
        assert_eq!(sandbox_file_name("", "file-2"), "file-2");
    }

    #[test]
    fn mime_from_extension() {
        assert_eq!(mime_for("chart.PNG"), "image/png");
        assert_eq!(mime_for("data.csv"), "text/csv");
        assert_eq!(mime_for("blob"), "application/octet-stream");
    }
}
