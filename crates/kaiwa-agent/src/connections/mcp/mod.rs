//! Tool connection backed by an MCP server over stdio.

pub mod protocol;
pub mod transport;

use std::time::Duration;

use async_trait::async_trait;
use kaiwa_core::config::McpServerConfig;
use serde_json::json;
use tracing::info;

use self::protocol::{initialize_params, McpCallResult, ToolsListResult};
use self::transport::{StdioTransport, TransportError};
use super::{ToolConnection, ToolInvocationError};
use crate::provider::ToolDefinition;
use crate::tools::normalize::ToolOutput;

impl From<TransportError> for ToolInvocationError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Timeout => ToolInvocationError::Transport("MCP request timed out".into()),
            other => ToolInvocationError::Transport(other.to_string()),
        }
    }
}

pub struct McpConnection {
    id: String,
    transport: StdioTransport,
}

impl McpConnection {
    /// Spawn the server and complete the `initialize` handshake.
    pub async fn connect(config: &McpServerConfig, timeout: Duration) -> Result<Self, ToolInvocationError> {
        let transport = StdioTransport::spawn(config, timeout)?;
        transport
            .request("initialize", Some(initialize_params()))
            .await?
            .into_result()
            .map_err(|e| ToolInvocationError::Transport(e.to_string()))?;
        transport.notify("notifications/initialized").await?;

        info!(connection = %config.id, command = %config.command, "MCP server initialized");
        Ok(Self {
            id: config.id.clone(),
            transport,
        })
    }
}

#[async_trait]
impl ToolConnection for McpConnection {
    fn id(&self) -> &str {
        &self.id
    }

    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, ToolInvocationError> {
        let value = self
            .transport
            .request("tools/list", None)
            .await?
            .into_result()
            .map_err(|e| ToolInvocationError::Transport(e.to_string()))?;
        let list: ToolsListResult = serde_json::from_value(value)
            .map_err(|e| ToolInvocationError::Transport(format!("bad tools/list result: {e}")))?;

        Ok(list
            .tools
            .into_iter()
            .map(|t| ToolDefinition {
                name: t.name,
                description: t.description,
                input_schema: t.input_schema,
                connection: self.id.clone(),
            })
            .collect())
    }

    async fn call_tool(
        &self,
        name: &str,
        input: serde_json::Value,
    ) -> Result<ToolOutput, ToolInvocationError> {
        let value = self
            .transport
            .request("tools/call", Some(json!({ "name": name, "arguments": input })))
            .await?
            .into_result()
            .map_err(|e| ToolInvocationError::Failed(e.message))?;

        let result: McpCallResult = match serde_json::from_value(value.clone()) {
            Ok(r) => r,
            // not the documented shape, hand the raw value over
            Err(_) => return Ok(ToolOutput::Json(value)),
        };

        if result.is_error {
            return Err(ToolInvocationError::Failed(result.text()));
        }
        Ok(ToolOutput::structured(result))
    }

    async fn close(&self) {
        self.transport.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INIT_REPLY: &str = r#"echo '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"fake","version":"0"}}}'"#;

    /// Answers `initialize`, swallows the initialized notification, then
    /// replies to request id 2 with `reply`.
    fn server(reply: &str) -> McpServerConfig {
        let body = format!(
            "read init\n{INIT_REPLY}\nread notified\nread call\nprintf '%s\\n' '{reply}'\nsleep 2"
        );
        McpServerConfig {
            id: "fake".into(),
            command: "sh".into(),
            args: vec!["-c".into(), body],
            env: Default::default(),
        }
    }

    #[tokio::test]
    async fn tools_are_listed_under_the_connection_id() {
        let conn = McpConnection::connect(
            &server(r#"{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"lookup","description":"Find"}]}}"#),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        let tools = conn.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "lookup");
        assert_eq!(tools[0].connection, "fake");
        assert_eq!(tools[0].input_schema["type"], "object");
        conn.close().await;
    }

    #[tokio::test]
    async fn structured_result_is_normalized() {
        let conn = McpConnection::connect(
            &server(r#"{"jsonrpc":"2.0","id":2,"result":{"content":[{"type":"text","text":"{\"n\":1}"}]}}"#),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        let out = conn.call_tool("lookup", json!({})).await.unwrap();
        assert_eq!(out.into_value(), json!({"n": 1}));
        conn.close().await;
    }

    #[tokio::test]
    async fn is_error_result_fails_the_call() {
        let conn = McpConnection::connect(
            &server(r#"{"jsonrpc":"2.0","id":2,"result":{"content":[{"type":"text","text":"bad input"}],"isError":true}}"#),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        let err = conn.call_tool("lookup", json!({"q": 1})).await.unwrap_err();
        assert!(matches!(err, ToolInvocationError::Failed(ref m) if m == "bad input"));
        conn.close().await;
    }

    #[tokio::test]
    async fn json_rpc_error_fails_the_call() {
        let conn = McpConnection::connect(
            &server(r#"{"jsonrpc":"2.0","id":2,"error":{"code":-32602,"message":"unknown tool"}}"#),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        let err = conn.call_tool("nope", json!({})).await.unwrap_err();
        assert!(matches!(err, ToolInvocationError::Failed(ref m) if m == "unknown tool"));
        conn.close().await;
    }
}
