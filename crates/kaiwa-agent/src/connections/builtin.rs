use async_trait::async_trait;

use super::{ToolConnection, ToolInvocationError};
use crate::provider::ToolDefinition;
use crate::tools::normalize::ToolOutput;
use crate::tools::{builtin_tools, to_definitions, Tool};

pub const BUILTIN_CONNECTION_ID: &str = "builtin";

/// In-process tools exposed as a connection.
pub struct BuiltinConnection {
    tools: Vec<Box<dyn Tool>>,
}

impl BuiltinConnection {
    pub fn new() -> Self {
        Self::with_tools(builtin_tools())
    }

    pub fn with_tools(tools: Vec<Box<dyn Tool>>) -> Self {
        Self { tools }
    }
}

impl Default for BuiltinConnection {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolConnection for BuiltinConnection {
    fn id(&self) -> &str {
        BUILTIN_CONNECTION_ID
    }

    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, ToolInvocationError> {
        Ok(to_definitions(&self.tools, BUILTIN_CONNECTION_ID))
    }

    async fn call_tool(
        &self,
        name: &str,
        input: serde_json::Value,
    ) -> Result<ToolOutput, ToolInvocationError> {
        let tool = self
            .tools
            .iter()
            .find(|t| t.name() == name)
            .ok_or_else(|| ToolInvocationError::UnknownTool(name.to_string()))?;

        let result = tool.execute(input).await;
        if result.is_error {
            return Err(ToolInvocationError::Failed(result.content));
        }
        Ok(ToolOutput::structured(result))
    }
}
