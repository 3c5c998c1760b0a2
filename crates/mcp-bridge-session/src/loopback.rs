//! In-process loopback transport.
//!
//! Useful for development and tests: no process is spawned, and every
//! tool call echoes its arguments back. Faults can be injected per
//! executable name to exercise the manager's failure paths.

use std::{
    collections::HashSet,
    time::Duration,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use mcp_bridge_core::{
    CallToolResult, ConnectError, Connection, Connector, InitializeResult, ProtocolError,
    ServerInfo, ServerParams, ToolDescriptor, ToolSession, Transport, TransportError,
    protocol::{LATEST_PROTOCOL_VERSION, RpcError},
};
use serde_json::{Map, Value, json};

/// Counters shared by a connector and everything it creates.
#[derive(Debug, Default)]
pub struct LoopbackStats {
    connects: AtomicUsize,
    handshakes: AtomicUsize,
    calls: AtomicUsize,
    close_attempts: AtomicUsize,
    closes: AtomicUsize,
    aborts: AtomicUsize,
}

impl LoopbackStats {
    #[must_use]
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn handshakes(&self) -> usize {
        self.handshakes.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn close_attempts(&self) -> usize {
        self.close_attempts.load(Ordering::SeqCst)
    }

    /// Successful closes.
    #[must_use]
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn aborts(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeFault {
    None,
    Reject,
    Stall,
}

/// Connector whose sessions live entirely in memory.
#[derive(Debug, Clone, Default)]
pub struct LoopbackConnector {
    stats: Arc<LoopbackStats>,
    reject_handshake: HashSet<String>,
    stall_handshake: HashSet<String>,
    fail_close: HashSet<String>,
    stall_close: HashSet<String>,
}

impl LoopbackConnector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Handshakes for `executable` fail with a remote error.
    #[must_use]
    pub fn reject_handshake(mut self, executable: impl Into<String>) -> Self {
        self.reject_handshake.insert(executable.into());
        self
    }

    /// Handshakes for `executable` never complete.
    #[must_use]
    pub fn stall_handshake(mut self, executable: impl Into<String>) -> Self {
        self.stall_handshake.insert(executable.into());
        self
    }

    /// Closing transports for `executable` fails.
    #[must_use]
    pub fn fail_close(mut self, executable: impl Into<String>) -> Self {
        self.fail_close.insert(executable.into());
        self
    }

    /// Closing transports for `executable` never completes.
    #[must_use]
    pub fn stall_close(mut self, executable: impl Into<String>) -> Self {
        self.stall_close.insert(executable.into());
        self
    }

    #[must_use]
    pub fn stats(&self) -> &LoopbackStats {
        &self.stats
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self, params: &ServerParams) -> Result<Connection, ConnectError> {
        let serial = self.stats.connects.fetch_add(1, Ordering::SeqCst) + 1;
        // Suspend once, like a real spawn would.
        tokio::task::yield_now().await;

        let fault = if self.reject_handshake.contains(&params.command) {
            HandshakeFault::Reject
        } else if self.stall_handshake.contains(&params.command) {
            HandshakeFault::Stall
        } else {
            HandshakeFault::None
        };
        let closed = Arc::new(AtomicBool::new(false));

        let session = LoopbackSession {
            stats: Arc::clone(&self.stats),
            name: params.command.clone(),
            fault,
            initialized: AtomicBool::new(false),
            closed: Arc::clone(&closed),
        };
        let transport = LoopbackTransport {
            stats: Arc::clone(&self.stats),
            serial,
            fail_close: self.fail_close.contains(&params.command),
            stall_close: self.stall_close.contains(&params.command),
            closed,
        };
        Ok(Connection::new(Arc::new(session), Box::new(transport)))
    }
}

struct LoopbackSession {
    stats: Arc<LoopbackStats>,
    name: String,
    fault: HandshakeFault,
    initialized: AtomicBool,
    closed: Arc<AtomicBool>,
}

impl LoopbackSession {
    fn ensure_open(&self) -> Result<(), ProtocolError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ProtocolError::Closed);
        }
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(ProtocolError::UnexpectedResponse(
                "session used before initialize".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ToolSession for LoopbackSession {
    async fn initialize(&self) -> Result<InitializeResult, ProtocolError> {
        self.stats.handshakes.fetch_add(1, Ordering::SeqCst);
        match self.fault {
            HandshakeFault::Reject => {
                return Err(RpcError {
                    code: -32603,
                    message: format!("{} refused the handshake", self.name),
                    data: None,
                }
                .into());
            }
            HandshakeFault::Stall => std::future::pending::<()>().await,
            HandshakeFault::None => {}
        }
        self.initialized.store(true, Ordering::SeqCst);
        Ok(InitializeResult {
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            capabilities: json!({ "tools": {} }),
            server_info: ServerInfo {
                name: format!("loopback:{}", self.name),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        })
    }

    async fn call_tool(
        &self,
        _name: &str,
        arguments: Map<String, Value>,
    ) -> Result<CallToolResult, ProtocolError> {
        self.ensure_open()?;
        self.stats.calls.fetch_add(1, Ordering::SeqCst);
        let text = match arguments.get("message").and_then(Value::as_str) {
            Some(message) => message.to_string(),
            None => Value::Object(arguments.clone()).to_string(),
        };
        Ok(CallToolResult {
            structured_content: Some(Value::Object(arguments)),
            ..CallToolResult::text(text)
        })
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ProtocolError> {
        self.ensure_open()?;
        Ok(vec![ToolDescriptor {
            name: "echo_tool".to_string(),
            description: Some("Echoes its arguments".to_string()),
            input_schema: json!({ "type": "object" }),
        }])
    }
}

struct LoopbackTransport {
    stats: Arc<LoopbackStats>,
    serial: usize,
    fail_close: bool,
    stall_close: bool,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn close(&mut self, _grace: Duration) -> Result<(), TransportError> {
        self.stats.close_attempts.fetch_add(1, Ordering::SeqCst);
        if self.stall_close {
            std::future::pending::<()>().await;
        }
        if self.fail_close {
            return Err(TransportError::Other(format!(
                "loopback #{} refused to close",
                self.serial
            )));
        }
        self.closed.store(true, Ordering::SeqCst);
        self.stats.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn abort(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        self.stats.aborts.fetch_add(1, Ordering::SeqCst);
    }

    fn describe(&self) -> String {
        format!("loopback #{}", self.serial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_session_requires_initialize() {
        let connector = LoopbackConnector::new();
        let conn = connector
            .connect(&ServerParams::parse("echo").unwrap())
            .await
            .unwrap();

        assert!(matches!(
            conn.session.call_tool("echo_tool", Map::new()).await,
            Err(ProtocolError::UnexpectedResponse(_))
        ));

        let init = conn.session.initialize().await.unwrap();
        assert_eq!(init.server_info.name, "loopback:echo");
        assert_eq!(connector.stats().handshakes(), 1);
    }

    #[tokio::test]
    async fn test_call_echoes_message_or_arguments() {
        let connector = LoopbackConnector::new();
        let conn = connector
            .connect(&ServerParams::parse("echo").unwrap())
            .await
            .unwrap();
        conn.session.initialize().await.unwrap();

        let mut args = Map::new();
        args.insert("message".to_string(), json!("hi"));
        let result = conn.session.call_tool("echo_tool", args).await.unwrap();
        assert_eq!(result.text_content(), "hi");

        let mut args = Map::new();
        args.insert("n".to_string(), json!(3));
        let result = conn.session.call_tool("count", args).await.unwrap();
        assert_eq!(result.text_content(), r#"{"n":3}"#);
        assert_eq!(result.structured_content, Some(json!({"n": 3})));
    }

    #[tokio::test]
    async fn test_closed_transport_closes_session() {
        let connector = LoopbackConnector::new().fail_close("stubborn");
        let mut ok = connector
            .connect(&ServerParams::parse("echo").unwrap())
            .await
            .unwrap();
        ok.session.initialize().await.unwrap();
        ok.transport.close(Duration::ZERO).await.unwrap();
        assert!(matches!(
            ok.session.list_tools().await,
            Err(ProtocolError::Closed)
        ));

        let mut stubborn = connector
            .connect(&ServerParams::parse("stubborn").unwrap())
            .await
            .unwrap();
        assert!(stubborn.transport.close(Duration::ZERO).await.is_err());
        assert_eq!(stubborn.transport.describe(), "loopback #2");
        assert_eq!(connector.stats().close_attempts(), 2);
        assert_eq!(connector.stats().closes(), 1);
    }
}
