//! Core traits for sessions, transports and connectors.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::{
    config::ServerParams,
    error::{ConnectError, ProtocolError, TransportError},
    protocol::{CallToolResult, InitializeResult, ToolDescriptor},
};

/// An MCP client session over some transport.
///
/// A session is unusable until `initialize` has completed successfully.
#[async_trait]
pub trait ToolSession: Send + Sync {
    /// Perform the initialization handshake.
    async fn initialize(&self) -> Result<InitializeResult, ProtocolError>;

    /// Call a tool by name.
    async fn call_tool(
        &self,
        name: &str,
        arguments: Map<String, Value>,
    ) -> Result<CallToolResult, ProtocolError>;

    /// List the tools the server advertises.
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ProtocolError>;
}

/// The resource backing a session (child process and its streams).
#[async_trait]
pub trait Transport: Send {
    /// Release the transport, terminating the backing process.
    ///
    /// The process gets up to `grace` to exit on its own before it is
    /// killed.
    async fn close(&mut self, grace: Duration) -> Result<(), TransportError>;

    /// Terminate the backing process without waiting.
    ///
    /// Used when `close` did not finish in time.
    fn abort(&mut self);

    /// Short label for traces, such as `pid 4242`.
    fn describe(&self) -> String;
}

/// A freshly opened, not yet initialized connection.
pub struct Connection {
    pub session: Arc<dyn ToolSession>,
    pub transport: Box<dyn Transport>,
}

impl Connection {
    #[must_use]
    pub fn new(session: Arc<dyn ToolSession>, transport: Box<dyn Transport>) -> Self {
        Self { session, transport }
    }
}

/// Opens connections to tool servers.
///
/// Implementations spawn or open the transport and wrap it in a session;
/// the handshake is left to the caller.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, params: &ServerParams) -> Result<Connection, ConnectError>;
}
