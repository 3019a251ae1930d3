//! Blocking-poll state machine for assistant runs.
//!
//! A run moves `queued -> in_progress -> completed` (or a failure status).
//! The poller re-reads the status at a fixed interval, gives up after the
//! policy's maximum wait, and stops early when its cancel token fires.

use std::sync::Arc;
use std::time::Duration;

use kaiwa_core::config::AssistantConfig;
use kaiwa_core::turn::ChatTurn;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::{AssistantMessage, AssistantsApi, AssistantsError, Attachment, RunHandle, RunReport, RunToolCall};
use crate::session::{SessionContext, TurnState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    /// `None` waits forever.
    pub max_wait: Option<Duration>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_wait: Some(Duration::from_secs(600)),
        }
    }
}

impl From<&AssistantConfig> for PollPolicy {
    fn from(cfg: &AssistantConfig) -> Self {
        Self {
            interval: Duration::from_millis(cfg.poll_interval_ms.max(1)),
            max_wait: (cfg.max_wait_secs > 0).then(|| Duration::from_secs(cfg.max_wait_secs)),
        }
    }
}

pub struct RunPoller {
    api: Arc<dyn AssistantsApi>,
    policy: PollPolicy,
}

impl RunPoller {
    pub fn new(api: Arc<dyn AssistantsApi>, policy: PollPolicy) -> Self {
        Self { api, policy }
    }

    pub fn api(&self) -> &Arc<dyn AssistantsApi> {
        &self.api
    }

    pub async fn submit(&self, thread_id: &str, assistant_id: &str) -> Result<RunHandle, AssistantsError> {
        let handle = self.api.create_run(thread_id, assistant_id).await?;
        info!(thread = %thread_id, run = %handle.run_id, "run submitted");
        Ok(handle)
    }

    /// Poll until the run finishes and return the newest assistant message.
    ///
    /// `handle.status` tracks every observation; `handle.usage` holds the
    /// last token counts the provider reported.
    #[instrument(skip(self, handle, cancel), fields(run = %handle.run_id))]
    pub async fn await_completion(
        &self,
        handle: &mut RunHandle,
        cancel: &CancellationToken,
    ) -> Result<AssistantMessage, AssistantsError> {
        let started = Instant::now();
        loop {
            let snapshot = self.api.retrieve_run(&handle.thread_id, &handle.run_id).await?;
            if snapshot.status != handle.status {
                debug!(from = %handle.status, to = %snapshot.status, "run status changed");
            }
            handle.status = snapshot.status;
            if snapshot.usage.is_some() {
                handle.usage = snapshot.usage;
            }

            if handle.status.is_failure() {
                let message = snapshot
                    .last_error
                    .unwrap_or_else(|| format!("run ended as {}", handle.status));
                warn!(status = %handle.status, error = %message, "run failed");
                return Err(AssistantsError::RunExecutionFailed {
                    status: handle.status,
                    message,
                });
            }
            if handle.status.is_terminal() {
                return self
                    .api
                    .latest_assistant_message(&handle.thread_id)
                    .await?
                    .ok_or(AssistantsError::NoAssistantMessage);
            }

            if let Some(max) = self.policy.max_wait {
                if started.elapsed() >= max {
                    self.cancel(handle).await;
                    return Err(AssistantsError::RunTimedOut { secs: max.as_secs() });
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    self.cancel(handle).await;
                    return Err(AssistantsError::Cancelled);
                }
                _ = tokio::time::sleep(self.policy.interval) => {}
            }
        }
    }

    /// Ask the provider to cancel the run. Best-effort: a failure is logged
    /// and reported, never escalated.
    pub async fn cancel(&self, handle: &RunHandle) -> bool {
        match self.api.cancel_run(&handle.thread_id, &handle.run_id).await {
            Ok(()) => {
                info!(run = %handle.run_id, "run cancel requested");
                true
            }
            Err(e) => {
                warn!(run = %handle.run_id, error = %e, "run cancel failed");
                false
            }
        }
    }

    /// Tools the run used, in order. Best-effort: the reply is already in
    /// hand, so a failed listing yields no tool calls.
    async fn tool_calls(&self, handle: &RunHandle) -> Vec<RunToolCall> {
        match self.api.list_run_tool_calls(&handle.thread_id, &handle.run_id).await {
            Ok(calls) => calls,
            Err(e) => {
                warn!(run = %handle.run_id, error = %e, "listing run steps failed");
                Vec::new()
            }
        }
    }

    /// One assistants-mode turn: post the user message to the provider
    /// thread (created on first use), run the assistant and wait for it.
    ///
    /// History is left untouched. The caller commits the turn with
    /// [`RunPoller::commit_turn`] once it has the final answer text, so the
    /// session holds exactly what gets persisted.
    pub async fn run_turn(
        &self,
        session: &mut SessionContext,
        assistant_id: &str,
        content: &str,
        attachments: &[Attachment],
        cancel: &CancellationToken,
    ) -> Result<RunReport, AssistantsError> {
        session.turn_state = TurnState::Streaming;
        let result = self
            .drive(session, assistant_id, content, attachments, cancel)
            .await;
        session.active_run = None;
        session.turn_state = if result.is_ok() {
            TurnState::Complete
        } else {
            TurnState::Idle
        };
        result
    }

    /// Append a finished turn to the session history.
    pub fn commit_turn(&self, session: &mut SessionContext, content: &str, answer: &str) {
        session.history.append(ChatTurn::user(content));
        session.history.append(ChatTurn::assistant(answer));
    }

    async fn drive(
        &self,
        session: &mut SessionContext,
        assistant_id: &str,
        content: &str,
        attachments: &[Attachment],
        cancel: &CancellationToken,
    ) -> Result<RunReport, AssistantsError> {
        let thread_id = match &session.provider_thread_id {
            Some(id) => id.clone(),
            None => {
                let id = self.api.create_thread().await?;
                session.provider_thread_id = Some(id.clone());
                id
            }
        };

        self.api.add_message(&thread_id, content, attachments).await?;
        let mut handle = self.submit(&thread_id, assistant_id).await?;
        session.active_run = Some(handle.clone());

        let result = self.await_completion(&mut handle, cancel).await;
        session.active_run = Some(handle.clone());
        let message = result?;
        Ok(RunReport {
            tool_calls: self.tool_calls(&handle).await,
            usage: handle.usage.unwrap_or_default(),
            message,
        })
    }
}
