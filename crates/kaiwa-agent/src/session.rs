//! Per-conversation state, passed explicitly to every turn.

use kaiwa_core::turn::ChatTurn;
use kaiwa_core::types::ThreadId;
use serde::Serialize;

use crate::assistants::RunHandle;

/// Where the turn controller currently is for this session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Idle,
    Streaming,
    ToolPending,
    Complete,
}

/// Ordered, append-only log of committed turns. Replayed in full on every
/// provider call.
#[derive(Debug, Clone, Default)]
pub struct MessageHistory {
    turns: Vec<ChatTurn>,
}

impl MessageHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_turns(turns: Vec<ChatTurn>) -> Self {
        Self { turns }
    }

    pub fn append(&mut self, turn: ChatTurn) {
        self.turns.push(turn);
    }

    pub fn turns(&self) -> &[ChatTurn] {
        &self.turns
    }

    /// Turns committed at or after position `start`.
    pub fn since(&self, start: usize) -> &[ChatTurn] {
        &self.turns[start.min(self.turns.len())..]
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn last(&self) -> Option<&ChatTurn> {
        self.turns.last()
    }
}

/// Everything one chat session owns: history, provider thread and active
/// run. Never shared between sessions.
#[derive(Debug)]
pub struct SessionContext {
    pub thread_id: ThreadId,
    pub history: MessageHistory,
    /// Provider-side thread (assistants mode), created lazily.
    pub provider_thread_id: Option<String>,
    /// Run currently being polled (assistants mode).
    pub active_run: Option<RunHandle>,
    pub turn_state: TurnState,
}

impl SessionContext {
    pub fn new(thread_id: ThreadId) -> Self {
        Self::with_history(thread_id, MessageHistory::new())
    }

    pub fn with_history(thread_id: ThreadId, history: MessageHistory) -> Self {
        Self {
            thread_id,
            history,
            provider_thread_id: None,
            active_run: None,
            turn_state: TurnState::Idle,
        }
    }

    /// A new session whose history starts with the system prompt and,
    /// when non-empty, the greeting as the first assistant turn.
    pub fn start(thread_id: ThreadId, system_prompt: &str, greeting: &str) -> Self {
        let mut history = MessageHistory::new();
        history.append(ChatTurn::system(system_prompt));
        if !greeting.is_empty() {
            history.append(ChatTurn::assistant(greeting));
        }
        Self::with_history(thread_id, history)
    }
}
