//! Callable façade binding a manager, a launch command and a tool name.

use std::sync::Arc;

use async_trait::async_trait;
use mcp_bridge_core::{CallToolResult, Connector, ManagerError};
use serde_json::{Map, Value};

use crate::manager::SessionManager;

/// A tool a pipeline driver can call by name with keyword arguments.
#[async_trait]
pub trait CallableTool: Send + Sync {
    /// Name used to call the tool.
    fn name(&self) -> &str;

    /// Human-readable description for introspection.
    fn description(&self) -> String;

    /// Call the tool.
    async fn call(&self, arguments: Map<String, Value>) -> Result<CallToolResult, ManagerError>;
}

/// Routes each call through `SessionManager::acquire` then `invoke`.
///
/// Several adapters may share one command, in which case they share one
/// session and one server process.
pub struct ToolAdapter<C>
where
    C: Connector,
{
    manager: Arc<SessionManager<C>>,
    command: String,
    tool_name: String,
    description: Option<String>,
}

impl<C> ToolAdapter<C>
where
    C: Connector,
{
    #[must_use]
    pub fn new(
        manager: Arc<SessionManager<C>>,
        command: impl Into<String>,
        tool_name: impl Into<String>,
    ) -> Self {
        Self {
            manager,
            command: command.into(),
            tool_name: tool_name.into(),
            description: None,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Call with an arbitrary JSON value.
    ///
    /// Objects are passed through as the argument map; any other value is
    /// sent as `{ "input": value }`.
    ///
    /// # Errors
    /// Returns the underlying creation or invocation error.
    pub async fn call_json(&self, arguments: Value) -> Result<CallToolResult, ManagerError> {
        let arguments = match arguments {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("input".to_string(), other);
                map
            }
        };
        self.call(arguments).await
    }
}

#[async_trait]
impl<C> CallableTool for ToolAdapter<C>
where
    C: Connector,
{
    fn name(&self) -> &str {
        &self.tool_name
    }

    fn description(&self) -> String {
        self.description
            .clone()
            .unwrap_or_else(|| format!("MCP tool (stdio): {}", self.tool_name))
    }

    async fn call(&self, arguments: Map<String, Value>) -> Result<CallToolResult, ManagerError> {
        tracing::debug!(
            tool = %self.tool_name,
            command = %self.command,
            "Calling tool through adapter"
        );
        let session = self.manager.acquire(&self.command).await?;
        let result = self
            .manager
            .invoke(&session, &self.tool_name, arguments)
            .await
            .inspect_err(|e| tracing::warn!(error = %e, "Tool call failed"))?;
        Ok(result)
    }
}
