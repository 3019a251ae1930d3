//! Assistants mode: the provider keeps the thread, we submit runs and poll.

pub mod client;
pub mod poller;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::provider::ProviderError;

pub use client::AssistantsClient;
pub use poller::{PollPolicy, RunPoller};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    RequiresAction,
    Cancelling,
    Completed,
    Failed,
    Cancelled,
    Expired,
    Incomplete,
    #[serde(other)]
    Unknown,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed
                | RunStatus::Failed
                | RunStatus::Cancelled
                | RunStatus::Expired
                | RunStatus::Incomplete
        )
    }

    pub fn is_failure(self) -> bool {
        self.is_terminal() && self != RunStatus::Completed
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::InProgress => "in_progress",
            RunStatus::RequiresAction => "requires_action",
            RunStatus::Cancelling => "cancelling",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Expired => "expired",
            RunStatus::Incomplete => "incomplete",
            RunStatus::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token counts the provider reports for a finished run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// A submitted run. Only the poller mutates `status` and `usage`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunHandle {
    pub thread_id: String,
    pub run_id: String,
    pub status: RunStatus,
    pub usage: Option<RunUsage>,
}

/// One status observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSnapshot {
    pub status: RunStatus,
    pub last_error: Option<String>,
    pub usage: Option<RunUsage>,
}

impl RunSnapshot {
    pub fn new(status: RunStatus) -> Self {
        Self {
            status,
            last_error: None,
            usage: None,
        }
    }
}

/// One tool the assistant used during a run (code interpreter, file
/// search or a function).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunToolCall {
    pub id: String,
    /// `code_interpreter`, `file_search`, or the function name.
    pub name: String,
    /// Code or function arguments, when the tool has any.
    pub input: Option<String>,
    /// Interpreter logs or function output.
    pub output: Option<String>,
    pub failed: bool,
}

/// What a completed run produced: the reply, the tools it used in order,
/// and its token usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub message: AssistantMessage,
    pub tool_calls: Vec<RunToolCall>,
    pub usage: RunUsage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Annotation {
    /// A file the assistant generated (code interpreter output).
    FilePath { text: String, file_id: String },
    /// A quote from an attached file (file search).
    FileCitation { text: String, file_id: String },
}

impl Annotation {
    pub fn text(&self) -> &str {
        match self {
            Annotation::FilePath { text, .. } | Annotation::FileCitation { text, .. } => text,
        }
    }
}

/// The assistant's reply once a run completes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AssistantMessage {
    pub id: String,
    pub text: String,
    pub annotations: Vec<Annotation>,
    pub image_file_ids: Vec<String>,
}

impl AssistantMessage {
    /// Replace each annotated span in the text with its resolved link.
    /// Spans without a replacement are left as they are.
    pub fn rewrite_annotations(&self, replacements: &[(String, String)]) -> String {
        let mut text = self.text.clone();
        for (span, url) in replacements {
            if !span.is_empty() {
                text = text.replace(span.as_str(), url);
            }
        }
        text
    }
}

/// A provider file attached to a user message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub file_id: String,
    pub mime: String,
}

/// Parameters for creating an assistant.
#[derive(Debug, Clone)]
pub struct AssistantSpec {
    pub name: String,
    pub instructions: String,
    pub model: String,
    pub temperature: f32,
    /// Files made available to the code interpreter.
    pub file_ids: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum AssistantsError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("run {status}: {message}")]
    RunExecutionFailed { status: RunStatus, message: String },

    #[error("run did not finish within {secs}s")]
    RunTimedOut { secs: u64 },

    #[error("run cancelled")]
    Cancelled,

    #[error("run completed without an assistant message")]
    NoAssistantMessage,

    #[error("seed file: {0}")]
    SeedFile(#[from] std::io::Error),
}

/// The slice of the assistants HTTP API this crate uses.
#[async_trait]
pub trait AssistantsApi: Send + Sync {
    async fn create_thread(&self) -> Result<String, ProviderError>;

    async fn add_message(
        &self,
        thread_id: &str,
        content: &str,
        attachments: &[Attachment],
    ) -> Result<(), ProviderError>;

    async fn create_run(&self, thread_id: &str, assistant_id: &str) -> Result<RunHandle, ProviderError>;

    async fn retrieve_run(&self, thread_id: &str, run_id: &str) -> Result<RunSnapshot, ProviderError>;

    async fn cancel_run(&self, thread_id: &str, run_id: &str) -> Result<(), ProviderError>;

    /// Tool calls made by the run's steps, oldest first.
    async fn list_run_tool_calls(&self, thread_id: &str, run_id: &str) -> Result<Vec<RunToolCall>, ProviderError>;

    /// Newest assistant-authored message in the thread.
    async fn latest_assistant_message(
        &self,
        thread_id: &str,
    ) -> Result<Option<AssistantMessage>, ProviderError>;

    async fn upload_file(&self, name: &str, bytes: Vec<u8>, mime: &str) -> Result<String, ProviderError>;

    async fn file_content(&self, file_id: &str) -> Result<Vec<u8>, ProviderError>;

    async fn create_assistant(&self, spec: &AssistantSpec) -> Result<String, ProviderError>;

    /// `None` when the provider does not know the id.
    async fn retrieve_assistant(&self, assistant_id: &str) -> Result<Option<String>, ProviderError>;
}
