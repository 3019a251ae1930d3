use async_trait::async_trait;
use kaiwa_core::config::ProviderConfig;
use kaiwa_core::turn::{ChatTurn, Role, ToolInvocation};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::debug;

use crate::provider::{check_status, ChatRequest, ChatResponse, LlmProvider, ProviderError};
use crate::stream::{parse_sse_line, SseParsed, StreamEvent, ToolCallFragment};

/// Chat-completions client for OpenAI and Azure OpenAI.
///
/// Azure mode is selected by an `api_version`: requests go to the deployment
/// named by `req.model` and authenticate with the `api-key` header.
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    api_version: Option<String>,
}

impl OpenAiProvider {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url
                .unwrap_or_else(|| "https://api.openai.com".to_string())
                .trim_end_matches('/')
                .to_string(),
            api_version: None,
        }
    }

    pub fn azure(api_key: String, endpoint: String, api_version: String) -> Self {
        Self {
            api_version: Some(api_version),
            ..Self::new(api_key, Some(endpoint))
        }
    }

    pub fn from_config(cfg: &ProviderConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(cfg.request_timeout_secs))
            .build()
            .unwrap_or_default();
        let mut provider = match &cfg.api_version {
            Some(version) => Self::azure(cfg.api_key.clone(), cfg.base_url.clone(), version.clone()),
            None => Self::new(cfg.api_key.clone(), Some(cfg.base_url.clone())),
        };
        provider.client = client;
        provider
    }

    fn is_azure(&self) -> bool {
        self.api_version.is_some()
    }

    fn completions_url(&self, model: &str) -> String {
        match &self.api_version {
            Some(version) => format!(
                "{}/openai/deployments/{}/chat/completions?api-version={}",
                self.base_url, model, version
            ),
            None => format!("{}/v1/chat/completions", self.base_url),
        }
    }

    fn post(&self, url: &str) -> reqwest::RequestBuilder {
        let builder = self.client.post(url).header("content-type", "application/json");
        if self.is_azure() {
            builder.header("api-key", &self.api_key)
        } else {
            builder.bearer_auth(&self.api_key)
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        if self.is_azure() {
            "azure-openai"
        } else {
            "openai"
        }
    }

    async fn send(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let body = build_request_body(req, false);
        let url = self.completions_url(&req.model);

        debug!(model = %req.model, provider = self.name(), "sending chat request");

        let resp = self.post(&url).json(&body).send().await?;
        let resp = check_status(resp, self.name()).await?;

        let api_resp: ApiResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        Ok(parse_response(api_resp))
    }

    async fn send_stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        let body = build_request_body(req, true);
        let url = self.completions_url(&req.model);

        debug!(model = %req.model, provider = self.name(), "sending streaming chat request");

        let resp = self.post(&url).json(&body).send().await?;
        let resp = check_status(resp, self.name()).await?;

        process_openai_stream(resp, req.model.clone(), tx).await;
        Ok(())
    }
}

fn turn_to_message(turn: &ChatTurn) -> serde_json::Value {
    match turn.role {
        Role::Tool => json!({
            "role": "tool",
            "tool_call_id": turn.tool_call_id.clone().unwrap_or_default(),
            "content": turn.content,
        }),
        Role::Assistant if !turn.tool_calls.is_empty() => {
            let calls: Vec<serde_json::Value> = turn
                .tool_calls
                .iter()
                .map(|c| {
                    json!({
                        "id": c.id,
                        "type": "function",
                        "function": { "name": c.name, "arguments": c.arguments },
                    })
                })
                .collect();
            // content must be null, not "", when the turn only carries calls
            let content = if turn.content.is_empty() {
                serde_json::Value::Null
            } else {
                json!(turn.content)
            };
            json!({ "role": "assistant", "content": content, "tool_calls": calls })
        }
        _ => json!({ "role": turn.role, "content": turn.content }),
    }
}

fn build_request_body(req: &ChatRequest, stream: bool) -> serde_json::Value {
    let messages: Vec<serde_json::Value> = req.turns.iter().map(turn_to_message).collect();

    let mut body = json!({
        "model": req.model,
        "messages": messages,
        "max_tokens": req.max_tokens,
        "stream": stream,
    });

    if let Some(t) = req.temperature {
        body["temperature"] = json!(t);
    }

    if !req.tools.is_empty() {
        let tools: Vec<serde_json::Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema,
                    },
                })
            })
            .collect();
        body["tools"] = json!(tools);
    }

    body
}

fn parse_response(resp: ApiResponse) -> ChatResponse {
    let choice = resp.choices.into_iter().next();
    let (content, tool_calls, stop_reason) = match choice {
        Some(c) => {
            let calls = c
                .message
                .tool_calls
                .unwrap_or_default()
                .into_iter()
                .enumerate()
                .map(|(index, call)| ToolInvocation {
                    index,
                    id: call.id,
                    name: call.function.name,
                    arguments: call.function.arguments,
                })
                .collect();
            (
                c.message.content.unwrap_or_default(),
                calls,
                c.finish_reason.unwrap_or_default(),
            )
        }
        None => (String::new(), Vec::new(), String::new()),
    };

    ChatResponse {
        content,
        model: resp.model,
        tokens_in: resp.usage.as_ref().map(|u| u.prompt_tokens).unwrap_or(0),
        tokens_out: resp.usage.as_ref().map(|u| u.completion_tokens).unwrap_or(0),
        stop_reason,
        tool_calls,
    }
}

/// Running totals carried across stream chunks.
#[derive(Default)]
struct StreamTotals {
    tokens_in: u32,
    tokens_out: u32,
    stop_reason: String,
}

/// Turn one `data:` payload into stream events. Returns `None` on `[DONE]`.
fn chunk_events(data: &str, totals: &mut StreamTotals) -> Option<Vec<StreamEvent>> {
    // OpenAI signals end-of-stream with a literal `[DONE]` data value
    if data.trim() == "[DONE]" {
        return None;
    }

    let mut events = Vec::new();
    let chunk = match serde_json::from_str::<StreamChunk>(data) {
        Ok(c) => c,
        Err(e) => {
            debug!(error = %e, "skipping unparseable stream chunk");
            return Some(events);
        }
    };

    // usage arrives on the final chunk when the endpoint reports it
    if let Some(usage) = &chunk.usage {
        totals.tokens_in = usage.prompt_tokens;
        totals.tokens_out = usage.completion_tokens;
    }

    for choice in chunk.choices {
        if let Some(reason) = choice.finish_reason {
            if !reason.is_empty() {
                totals.stop_reason = reason;
            }
        }
        if let Some(content) = choice.delta.content {
            if !content.is_empty() {
                events.push(StreamEvent::TextDelta { text: content });
            }
        }
        for call in choice.delta.tool_calls.unwrap_or_default() {
            let (name, arguments) = match call.function {
                Some(f) => (f.name, f.arguments),
                None => (None, None),
            };
            events.push(StreamEvent::ToolCallDelta(ToolCallFragment {
                index: call.index,
                id: call.id.filter(|id| !id.is_empty()),
                name,
                arguments,
            }));
        }
    }

    Some(events)
}

/// Parse OpenAI streaming SSE response and emit StreamEvents.
/// Each data line contains a JSON delta object; `data: [DONE]` signals end.
async fn process_openai_stream(
    resp: reqwest::Response,
    model: String,
    tx: mpsc::Sender<StreamEvent>,
) {
    pump_sse(resp.bytes_stream(), model, tx).await;
}

/// Drive a raw SSE byte stream to completion.
///
/// Only `data: [DONE]` ends the stream successfully. A body that stops
/// without it was cut off, so the consumer gets an `Error` instead of `Done`.
async fn pump_sse<S, B, E>(mut byte_stream: S, model: String, tx: mpsc::Sender<StreamEvent>)
where
    S: futures_util::Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    use futures_util::StreamExt;

    let mut totals = StreamTotals::default();
    // raw bytes so a UTF-8 sequence split across chunks survives
    let mut line_buf: Vec<u8> = Vec::new();
    let mut saw_done = false;

    'read: while let Some(chunk) = byte_stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                let _ = tx
                    .send(StreamEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
                return;
            }
        };

        line_buf.extend_from_slice(chunk.as_ref());

        while let Some(pos) = line_buf.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = line_buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let Some(SseParsed::Data(data)) = parse_sse_line(line) else {
                continue;
            };

            let Some(events) = chunk_events(&data, &mut totals) else {
                saw_done = true;
                break 'read;
            };
            for event in events {
                if tx.send(event).await.is_err() {
                    return; // receiver dropped
                }
            }
        }
    }

    let event = if saw_done {
        StreamEvent::Done {
            model,
            tokens_in: totals.tokens_in,
            tokens_out: totals.tokens_out,
            stop_reason: totals.stop_reason,
        }
    } else {
        StreamEvent::Error {
            message: "stream ended before [DONE]".to_string(),
        }
    };
    let _ = tx.send(event).await;
}

// Response types (private, deserialization only)

#[derive(Deserialize)]
struct ApiResponse {
    #[serde(default)]
    model: String,
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChatMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ApiToolCall>>,
}

#[derive(Deserialize)]
struct ApiToolCall {
    id: String,
    function: ApiFunction,
}

#[derive(Deserialize)]
struct ApiFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

// Streaming chunk types

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<StreamToolCall>>,
}

#[derive(Deserialize)]
struct StreamToolCall {
    index: usize,
    id: Option<String>,
    function: Option<StreamFunction>,
}

#[derive(Deserialize)]
struct StreamFunction {
    name: Option<String>,
    arguments: Option<String>,
}
