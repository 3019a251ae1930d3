use kaiwa_core::turn::Role;
use serde::{Deserialize, Serialize};

/// A persisted conversation owned by one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub id: String,
    pub user_id: String,
    /// Login identifier of the owner (usually an email).
    pub user_identifier: String,
    pub name: String,
    /// Provider-side thread id in assistants mode.
    pub provider_thread_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// One committed chat turn, ordered by `seq` within its thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub thread_id: String,
    pub seq: i64,
    pub role: Role,
    /// Display name: the tool name for tool turns, the role otherwise.
    pub name: String,
    pub content: String,
    pub tool_call_id: Option<String>,
    /// JSON array of tool invocations, assistant turns only.
    pub tool_calls: Option<String>,
    pub created_at: String,
    pub start: String,
    pub end: String,
}

/// A file attached to a thread, stored in blob storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub id: String,
    pub thread_id: String,
    pub step_id: Option<String>,
    pub name: String,
    pub mime: String,
    pub object_key: String,
    pub url: String,
    pub size: i64,
    pub created_at: String,
}

/// Input for [`crate::ThreadManager::add_element`].
#[derive(Debug, Clone)]
pub struct NewElement {
    pub thread_id: String,
    pub step_id: Option<String>,
    pub name: String,
    pub mime: String,
    pub object_key: String,
    pub url: String,
    pub size: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub id: String,
    pub step_id: String,
    /// -1 (bad), 0 (neutral) or 1 (good).
    pub value: i64,
    pub comment: Option<String>,
    pub created_at: String,
}
