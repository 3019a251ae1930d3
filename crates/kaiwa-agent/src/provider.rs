use async_trait::async_trait;
use kaiwa_core::turn::{ChatTurn, ToolInvocation};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::stream::{StreamEvent, ToolCallFragment};

/// Tool definition sent to the LLM API.
///
/// `connection` names the tool connection that owns the tool. It is routing
/// metadata for the bridge and never leaves the process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    #[serde(skip)]
    pub connection: String,
}

/// Request to an LLM provider.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    /// Full history, system turn first. Replayed on every call.
    pub turns: Vec<ChatTurn>,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    pub stream: bool,
    /// Tools to expose to the LLM. Empty disables tool calling.
    pub tools: Vec<ToolDefinition>,
}

/// Response from an LLM provider (non-streaming).
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub model: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub stop_reason: String,
    /// Tool calls requested by the LLM, already complete. Empty when none.
    pub tool_calls: Vec<ToolInvocation>,
}

/// Common interface for chat-completion providers.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name for logging and error messages.
    fn name(&self) -> &str;

    /// Send a non-streaming chat request, wait for full response.
    async fn send(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError>;

    /// Stream response events through a channel.
    ///
    /// Default: falls back to non-streaming send and replays the response as
    /// one text delta, one whole fragment per tool call, then Done.
    async fn send_stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        let resp = self.send(req).await?;
        if !resp.content.is_empty() {
            let _ = tx.send(StreamEvent::TextDelta { text: resp.content }).await;
        }
        for call in resp.tool_calls {
            let _ = tx
                .send(StreamEvent::ToolCallDelta(ToolCallFragment {
                    index: call.index,
                    id: Some(call.id),
                    name: Some(call.name),
                    arguments: Some(call.arguments),
                }))
                .await;
        }
        let _ = tx
            .send(StreamEvent::Done {
                model: resp.model,
                tokens_in: resp.tokens_in,
                tokens_out: resp.tokens_out,
                stop_reason: resp.stop_reason,
            })
            .await;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("operation cancelled")]
    Cancelled,
}

/// Map a non-success HTTP response to the matching `ProviderError`.
///
/// Shared by the chat-completions and assistants clients.
pub(crate) async fn check_status(
    resp: reqwest::Response,
    provider: &str,
) -> Result<reqwest::Response, ProviderError> {
    let status = resp.status().as_u16();
    if status == 429 {
        let retry = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(|s| s * 1000) // convert seconds to ms
            .unwrap_or(5000);
        return Err(ProviderError::RateLimited {
            retry_after_ms: retry,
        });
    }

    if !resp.status().is_success() {
        let text = resp.text().await.unwrap_or_default();
        tracing::warn!(status, provider, body = %text, "provider API error");
        return Err(ProviderError::Api {
            status,
            message: text,
        });
    }

    Ok(resp)
}
