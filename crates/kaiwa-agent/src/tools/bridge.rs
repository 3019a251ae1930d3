//! Dispatches one model tool call to the connection that owns the tool.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::connections::{ConnectionRegistry, ToolInvocationError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("tool connection '{0}' is not connected")]
    ConnectionNotFound(String),
}

/// Normalized payload of one call, plus whether the call itself failed.
///
/// `is_error` comes from the invocation, not the payload: a tool may
/// legitimately return data with an `error` key.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallResult {
    pub value: Value,
    pub is_error: bool,
}

impl ToolCallResult {
    pub fn ok(value: Value) -> Self {
        Self { value, is_error: false }
    }

    pub fn failed(message: &str) -> Self {
        Self {
            value: error_payload(message),
            is_error: true,
        }
    }
}

pub struct ToolBridge {
    registry: Arc<ConnectionRegistry>,
    call_timeout: Duration,
}

impl ToolBridge {
    pub fn new(registry: Arc<ConnectionRegistry>, call_timeout: Duration) -> Self {
        Self {
            registry,
            call_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Run `tool_name` on `connection_id` and return a JSON payload.
    ///
    /// Only a missing connection is an `Err`. A failing or timed-out call
    /// comes back as `{"error": message}` so the model can react to it.
    pub async fn execute(
        &self,
        tool_name: &str,
        tool_input: Value,
        connection_id: &str,
    ) -> Result<ToolCallResult, BridgeError> {
        let connection = self
            .registry
            .get(connection_id)
            .ok_or_else(|| BridgeError::ConnectionNotFound(connection_id.to_string()))?;

        debug!(tool = %tool_name, connection = %connection_id, "executing tool");

        let outcome = match tokio::time::timeout(
            self.call_timeout,
            connection.call_tool(tool_name, tool_input),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ToolInvocationError::Timeout {
                secs: self.call_timeout.as_secs(),
            }),
        };

        Ok(match outcome {
            Ok(output) => ToolCallResult::ok(output.into_value()),
            Err(e) => {
                warn!(tool = %tool_name, connection = %connection_id, error = %e, "tool call failed");
                ToolCallResult::failed(&e.to_string())
            }
        })
    }
}

pub fn error_payload(message: &str) -> Value {
    json!({ "error": message })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::builtin::BuiltinConnection;
    use crate::connections::ToolConnection;
    use crate::provider::ToolDefinition;
    use crate::tools::normalize::ToolOutput;
    use async_trait::async_trait;

    struct Sleepy;

    #[async_trait]
    impl ToolConnection for Sleepy {
        fn id(&self) -> &str {
            "sleepy"
        }
        async fn list_tools(&self) -> Result<Vec<ToolDefinition>, ToolInvocationError> {
            Ok(Vec::new())
        }
        async fn call_tool(&self, _: &str, _: Value) -> Result<ToolOutput, ToolInvocationError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(ToolOutput::Json(Value::Null))
        }
    }

    fn bridge() -> ToolBridge {
        let registry = Arc::new(ConnectionRegistry::new());
        registry.connect(Arc::new(BuiltinConnection::new()));
        registry.connect(Arc::new(Sleepy));
        ToolBridge::new(registry, Duration::from_millis(50))
    }

    #[tokio::test]
    async fn successful_call_returns_normalized_json() {
        let out = bridge()
            .execute("calculator", json!({"operation": "add", "a": 2, "b": 3}), "builtin")
            .await
            .unwrap();
        assert_eq!(out, ToolCallResult::ok(json!({"result": 5.0})));
    }

    #[tokio::test]
    async fn tool_failure_becomes_error_payload() {
        let out = bridge()
            .execute("calculator", json!({"operation": "divide", "a": 1, "b": 0}), "builtin")
            .await
            .unwrap();
        assert_eq!(out, ToolCallResult::failed("Division by zero"));
    }

    #[tokio::test]
    async fn unknown_tool_becomes_error_payload() {
        let out = bridge().execute("nope", json!({}), "builtin").await.unwrap();
        assert_eq!(out.value, json!({"error": "unknown tool: nope"}));
        assert!(out.is_error);
    }

    #[tokio::test]
    async fn timeout_becomes_error_payload() {
        let out = bridge().execute("anything", json!({}), "sleepy").await.unwrap();
        assert!(out.is_error);
        assert!(out.value["error"].as_str().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn missing_connection_is_an_error() {
        let b = bridge();
        b.registry().disconnect("builtin");
        let err = b.execute("calculator", json!({}), "builtin").await.unwrap_err();
        assert_eq!(err, BridgeError::ConnectionNotFound("builtin".into()));
    }
}
