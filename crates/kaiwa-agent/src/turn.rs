//! Drives one user turn: stream the reply, run requested tools, then stream
//! the final answer.
//!
//! ```text
//! Idle -> Streaming -> Complete
//!             |
//!             +-> ToolPending -> Streaming -> Complete
//! ```
//!
//! Only finished turns are appended to the session history. A failed or
//! cancelled turn leaves the history as it was after the last commit.

use std::sync::Arc;

use kaiwa_core::turn::ChatTurn;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::aggregate::{ReadyCall, ToolCallAggregator};
use crate::provider::{ChatRequest, LlmProvider, ProviderError, ToolDefinition};
use crate::session::{SessionContext, TurnState};
use crate::stream::StreamEvent;
use crate::tools::bridge::{ToolBridge, ToolCallResult};

/// Provider events buffered between the HTTP reader and the turn loop.
const STREAM_BUFFER: usize = 64;

/// What the UI sees while a turn runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    Token { text: String },
    ToolStarted { id: String, name: String },
    ToolFinished { id: String, name: String, is_error: bool },
    /// What a provider-hosted tool ran and printed (assistants mode).
    ToolOutput {
        id: String,
        input: Option<String>,
        output: Option<String>,
    },
    Error { message: String },
    Done { model: String, tokens_in: u32, tokens_out: u32 },
}

#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("turn cancelled")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct TurnOptions {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    /// Tool rounds allowed before the model's text is taken as the answer.
    pub max_tool_rounds: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    /// History position of the user turn that opened this turn. Everything
    /// from here on was committed by it.
    pub first_new_turn: usize,
    pub answer: String,
    pub tool_rounds: usize,
    pub model: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
}

/// What one provider call produced.
#[derive(Default)]
struct Pass {
    content: String,
    aggregator: ToolCallAggregator,
    model: String,
    tokens_in: u32,
    tokens_out: u32,
}

pub struct TurnController {
    provider: Arc<dyn LlmProvider>,
    bridge: Arc<ToolBridge>,
    options: TurnOptions,
}

impl TurnController {
    pub fn new(provider: Arc<dyn LlmProvider>, bridge: Arc<ToolBridge>, options: TurnOptions) -> Self {
        Self {
            provider,
            bridge,
            options,
        }
    }

    pub fn options(&self) -> &TurnOptions {
        &self.options
    }

    /// Run one user turn against `session`.
    ///
    /// Text is forwarded to `sink` as it streams; each send waits until the
    /// receiver has room. A closed sink counts as cancellation.
    #[instrument(skip_all, fields(thread = %session.thread_id))]
    pub async fn run_turn(
        &self,
        session: &mut SessionContext,
        user_message: &str,
        tools: &[ToolDefinition],
        sink: &mpsc::Sender<TurnEvent>,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, TurnError> {
        let first_new_turn = session.history.len();
        session.history.append(ChatTurn::user(user_message));

        let result = self.drive(session, tools, sink, cancel, first_new_turn).await;
        match &result {
            Ok(outcome) => {
                session.turn_state = TurnState::Complete;
                info!(
                    rounds = outcome.tool_rounds,
                    tokens_in = outcome.tokens_in,
                    tokens_out = outcome.tokens_out,
                    "turn complete"
                );
            }
            Err(e) => {
                session.turn_state = TurnState::Idle;
                warn!(error = %e, "turn aborted");
                let _ = sink
                    .send(TurnEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
            }
        }
        result
    }

    async fn drive(
        &self,
        session: &mut SessionContext,
        tools: &[ToolDefinition],
        sink: &mpsc::Sender<TurnEvent>,
        cancel: &CancellationToken,
        first_new_turn: usize,
    ) -> Result<TurnOutcome, TurnError> {
        let mut outcome = TurnOutcome {
            first_new_turn,
            answer: String::new(),
            tool_rounds: 0,
            model: self.options.model.clone(),
            tokens_in: 0,
            tokens_out: 0,
        };

        loop {
            session.turn_state = TurnState::Streaming;
            let pass = self.stream_pass(session, tools, sink, cancel).await?;
            outcome.tokens_in += pass.tokens_in;
            outcome.tokens_out += pass.tokens_out;
            if !pass.model.is_empty() {
                outcome.model = pass.model.clone();
            }

            if !pass.aggregator.has_pending() {
                return Ok(self.commit_answer(session, pass.content, outcome, sink).await);
            }

            if outcome.tool_rounds >= self.options.max_tool_rounds {
                warn!(
                    rounds = outcome.tool_rounds,
                    requested = pass.aggregator.snapshot().len(),
                    "tool round limit reached, ignoring further tool calls"
                );
                return Ok(self.commit_answer(session, pass.content, outcome, sink).await);
            }

            session.turn_state = TurnState::ToolPending;

            let mut ready = Vec::new();
            for finalized in pass.aggregator.finalize() {
                match finalized {
                    Ok(call) => ready.push(call),
                    Err(e) => {
                        warn!(index = e.index, tool = %e.name, "skipping tool call with malformed arguments");
                        let _ = sink
                            .send(TurnEvent::Error {
                                message: e.to_string(),
                            })
                            .await;
                    }
                }
            }

            if ready.is_empty() {
                debug!("no executable tool calls, answering with streamed text");
                return Ok(self.commit_answer(session, pass.content, outcome, sink).await);
            }

            if cancel.is_cancelled() {
                return Err(TurnError::Cancelled);
            }

            session.history.append(ChatTurn::assistant_with_tools(
                pass.content,
                ready.iter().map(|c| c.invocation.clone()).collect(),
            ));
            self.execute_calls(session, ready, tools, sink, cancel).await?;
            outcome.tool_rounds += 1;
        }
    }

    /// One provider call. The provider and the consumer run concurrently on
    /// this task; dropping the joined future aborts the HTTP stream.
    async fn stream_pass(
        &self,
        session: &SessionContext,
        tools: &[ToolDefinition],
        sink: &mpsc::Sender<TurnEvent>,
        cancel: &CancellationToken,
    ) -> Result<Pass, TurnError> {
        let req = ChatRequest {
            model: self.options.model.clone(),
            turns: session.history.turns().to_vec(),
            max_tokens: self.options.max_tokens,
            temperature: self.options.temperature,
            stream: true,
            tools: tools.to_vec(),
        };
        debug!(turns = req.turns.len(), tools = req.tools.len(), "streaming pass");

        let (tx, mut rx) = mpsc::channel::<StreamEvent>(STREAM_BUFFER);
        let provider = Arc::clone(&self.provider);

        let produce = async move { provider.send_stream(&req, tx).await };

        let consume = async move {
            let mut pass = Pass::default();
            let mut finished = false;
            while let Some(event) = rx.recv().await {
                match event {
                    StreamEvent::TextDelta { text } => {
                        pass.content.push_str(&text);
                        if sink.send(TurnEvent::Token { text }).await.is_err() {
                            return Err(TurnError::Cancelled);
                        }
                    }
                    StreamEvent::ToolCallDelta(fragment) => pass.aggregator.apply(fragment),
                    StreamEvent::Done {
                        model,
                        tokens_in,
                        tokens_out,
                        ..
                    } => {
                        pass.model = model;
                        pass.tokens_in = tokens_in;
                        pass.tokens_out = tokens_out;
                        finished = true;
                    }
                    StreamEvent::Error { message } => {
                        return Err(TurnError::Provider(ProviderError::Stream(message)));
                    }
                }
            }
            if !finished {
                return Err(TurnError::Provider(ProviderError::Stream(
                    "provider stream closed without completing".to_string(),
                )));
            }
            Ok(pass)
        };

        let (produced, consumed) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TurnError::Cancelled),
            both = async { tokio::join!(produce, consume) } => both,
        };

        // a request that never started closes the channel, so check it first
        produced?;
        consumed
    }

    /// Run finalized calls strictly in index order, one tool turn each.
    ///
    /// A stop request interrupts the running call and skips the rest. Each
    /// call of the committed assistant turn still gets a tool turn, so the
    /// history stays valid for the next request.
    async fn execute_calls(
        &self,
        session: &mut SessionContext,
        ready: Vec<ReadyCall>,
        tools: &[ToolDefinition],
        sink: &mpsc::Sender<TurnEvent>,
        cancel: &CancellationToken,
    ) -> Result<(), TurnError> {
        for ReadyCall { invocation, input } in ready {
            if cancel.is_cancelled() {
                let skipped = ToolCallResult::failed("cancelled");
                session
                    .history
                    .append(ChatTurn::tool_result(invocation.id, skipped.value.to_string()));
                continue;
            }

            let _ = sink
                .send(TurnEvent::ToolStarted {
                    id: invocation.id.clone(),
                    name: invocation.name.clone(),
                })
                .await;

            let result = match tools.iter().find(|d| d.name == invocation.name) {
                None => ToolCallResult::failed(&format!("unknown tool: {}", invocation.name)),
                Some(def) => {
                    let call = self.bridge.execute(&invocation.name, input, &def.connection);
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => ToolCallResult::failed("cancelled"),
                        executed = call => match executed {
                            Ok(result) => result,
                            Err(e) => {
                                let _ = sink
                                    .send(TurnEvent::Error {
                                        message: e.to_string(),
                                    })
                                    .await;
                                ToolCallResult::failed(&e.to_string())
                            }
                        },
                    }
                }
            };

            session
                .history
                .append(ChatTurn::tool_result(invocation.id.clone(), result.value.to_string()));

            let _ = sink
                .send(TurnEvent::ToolFinished {
                    id: invocation.id,
                    name: invocation.name,
                    is_error: result.is_error,
                })
                .await;
        }

        if cancel.is_cancelled() {
            return Err(TurnError::Cancelled);
        }
        Ok(())
    }

    async fn commit_answer(
        &self,
        session: &mut SessionContext,
        content: String,
        mut outcome: TurnOutcome,
        sink: &mpsc::Sender<TurnEvent>,
    ) -> TurnOutcome {
        session.history.append(ChatTurn::assistant(content.clone()));
        outcome.answer = content;
        let _ = sink
            .send(TurnEvent::Done {
                model: outcome.model.clone(),
                tokens_in: outcome.tokens_in,
                tokens_out: outcome.tokens_out,
            })
            .await;
        outcome
    }
}
