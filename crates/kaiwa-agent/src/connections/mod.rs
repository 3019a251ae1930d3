//! Live tool connections and the registry the bridge resolves them from.
//!
//! The gateway connects and disconnects entries. Callers only clone the
//! `Arc` for the duration of one call and never own the connection.

pub mod builtin;
pub mod mcp;

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{info, warn};

use crate::provider::ToolDefinition;
use crate::tools::normalize::ToolOutput;

#[derive(Debug, thiserror::Error)]
pub enum ToolInvocationError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("{0}")]
    Failed(String),

    #[error("tool timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("transport error: {0}")]
    Transport(String),
}

/// A source of tools: the in-process builtins or an external MCP server.
#[async_trait]
pub trait ToolConnection: Send + Sync {
    /// Registry key. Tool definitions carry it as their `connection`.
    fn id(&self) -> &str;

    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, ToolInvocationError>;

    async fn call_tool(
        &self,
        name: &str,
        input: serde_json::Value,
    ) -> Result<ToolOutput, ToolInvocationError>;

    /// Release external resources. Default: nothing to release.
    async fn close(&self) {}
}

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<String, Arc<dyn ToolConnection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection, replacing any previous one with the same id.
    pub fn connect(&self, connection: Arc<dyn ToolConnection>) {
        let id = connection.id().to_string();
        info!(connection = %id, "tool connection registered");
        self.connections.insert(id, connection);
    }

    /// Remove a connection. In-flight calls keep their own `Arc`.
    pub fn disconnect(&self, id: &str) -> Option<Arc<dyn ToolConnection>> {
        let removed = self.connections.remove(id).map(|(_, c)| c);
        if removed.is_some() {
            info!(connection = %id, "tool connection removed");
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ToolConnection>> {
        self.connections.get(id).map(|c| Arc::clone(c.value()))
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.connections.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Definitions from every live connection, in connection-id order.
    /// A connection that fails to list is skipped with a warning.
    pub async fn list_all_tools(&self) -> Vec<ToolDefinition> {
        let mut defs = Vec::new();
        for id in self.ids() {
            let Some(conn) = self.get(&id) else { continue };
            match conn.list_tools().await {
                Ok(mut tools) => defs.append(&mut tools),
                Err(e) => warn!(connection = %id, error = %e, "listing tools failed"),
            }
        }
        defs
    }

    /// Disconnect and close every connection (gateway shutdown).
    pub async fn close_all(&self) {
        for id in self.ids() {
            if let Some(conn) = self.disconnect(&id) {
                conn.close().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::builtin::BuiltinConnection;

    #[tokio::test]
    async fn connect_list_disconnect() {
        let registry = ConnectionRegistry::new();
        registry.connect(Arc::new(BuiltinConnection::new()));
        assert_eq!(registry.ids(), vec!["builtin"]);

        let tools = registry.list_all_tools().await;
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["calculator", "weather"]);
        assert!(tools.iter().all(|t| t.connection == "builtin"));

        assert!(registry.disconnect("builtin").is_some());
        assert!(registry.get("builtin").is_none());
        assert!(registry.list_all_tools().await.is_empty());
    }
}
