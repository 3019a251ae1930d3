//! JSON-RPC 2.0 messages exchanged with MCP servers, one JSON object per line.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::tools::normalize::{public_fields, Serializable};

pub const PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// Fire-and-forget message (no `id`, no response).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            method: method.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn into_result(self) -> Result<Value, JsonRpcError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, thiserror::Error)]
#[error("JSON-RPC error {code}: {message}")]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

pub fn initialize_params() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": { "name": "kaiwa", "version": env!("CARGO_PKG_VERSION") },
    })
}

/// One entry of a `tools/list` result.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpToolDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_schema")]
    pub input_schema: Value,
}

fn default_schema() -> Value {
    json!({ "type": "object", "properties": {} })
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolsListResult {
    pub tools: Vec<McpToolDef>,
}

/// A `tools/call` result.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpCallResult {
    #[serde(default)]
    pub content: Vec<McpContent>,
    pub structured_content: Option<Value>,
    #[serde(default)]
    pub is_error: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum McpContent {
    Text { text: String },
    Image { data: String, #[serde(rename = "mimeType")] mime_type: String },
    Resource { resource: Value },
    #[serde(other)]
    Other,
}

impl McpCallResult {
    /// Concatenated text blocks, used as the error message when `is_error`.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| match c {
                McpContent::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl Serializable for McpCallResult {
    fn to_value(&self) -> Value {
        if let Some(structured) = &self.structured_content {
            return public_fields(structured);
        }

        match self.content.as_slice() {
            [] => Value::Null,
            // a lone text block is usually JSON the server serialized for us
            [McpContent::Text { text }] => {
                serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.clone()))
            }
            blocks if blocks.iter().all(|b| matches!(b, McpContent::Text { .. })) => {
                Value::String(self.text())
            }
            blocks => Value::Array(
                blocks
                    .iter()
                    .map(|b| match b {
                        McpContent::Text { text } => json!({ "type": "text", "text": text }),
                        // image bytes are useless to the model; keep the shape only
                        McpContent::Image { mime_type, data } => {
                            json!({ "type": "image", "mime_type": mime_type, "bytes": data.len() })
                        }
                        McpContent::Resource { resource } => {
                            json!({ "type": "resource", "resource": public_fields(resource) })
                        }
                        McpContent::Other => json!({ "type": "unknown" }),
                    })
                    .collect(),
            ),
        }
    }
}
