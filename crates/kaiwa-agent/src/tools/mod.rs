//! Tool system for AI agent tool calling.
//!
//! In-process tools implement [`Tool`]; the [`bridge`] dispatches model tool
//! calls to whichever connection owns the tool and normalizes the result.

pub mod bridge;
pub mod calculator;
pub mod normalize;
pub mod weather;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::provider::ToolDefinition;

/// Result of executing a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// Text content returned to the LLM. JSON text for structured results.
    pub content: String,
    /// Whether the tool execution failed.
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn json(value: serde_json::Value) -> Self {
        Self::success(value.to_string())
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: message.into(),
            is_error: true,
        }
    }
}

/// Trait that all tools must implement.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name for this tool (e.g. "calculator").
    fn name(&self) -> &str;
    /// Human-readable description of what this tool does.
    fn description(&self) -> &str;
    /// JSON Schema for the tool's input parameters.
    fn input_schema(&self) -> serde_json::Value;
    /// Execute the tool with the given input.
    async fn execute(&self, input: serde_json::Value) -> ToolResult;
}

/// The built-in tools shipped with the gateway.
pub fn builtin_tools() -> Vec<Box<dyn Tool>> {
    vec![
        Box::new(calculator::CalculatorTool),
        Box::new(weather::WeatherTool),
    ]
}

/// Convert a slice of tools to API-level tool definitions owned by `connection`.
pub fn to_definitions(tools: &[Box<dyn Tool>], connection: &str) -> Vec<ToolDefinition> {
    tools
        .iter()
        .map(|t| ToolDefinition {
            name: t.name().to_string(),
            description: t.description().to_string(),
            input_schema: t.input_schema(),
            connection: connection.to_string(),
        })
        .collect()
}
