//! Error taxonomy for transports, sessions and the session manager.

use std::time::Duration;

use thiserror::Error;

use crate::protocol::RpcError;

/// Session protocol error.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Transport closed")]
    Closed,
    #[error("Remote error {code}: {message}")]
    Remote { code: i64, message: String },
    #[error("Tool reported failure: {message}")]
    ToolFailed { message: String },
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl From<RpcError> for ProtocolError {
    fn from(e: RpcError) -> Self {
        Self::Remote {
            code: e.code,
            message: e.message,
        }
    }
}

/// Error while opening a connection to a tool server.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Launch command is empty")]
    EmptyCommand,
    #[error("Executable not found: {0}")]
    ExecutableNotFound(String),
    #[error("Spawn failed: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("Child process is missing a piped stdin or stdout")]
    MissingStdio,
    #[error("Handshake failed: {0}")]
    Handshake(#[source] ProtocolError),
    #[error("Handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
}

/// Error while closing a transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to kill process: {0}")]
    Kill(#[source] std::io::Error),
    #[error("Close timed out after {0:?}")]
    CloseTimeout(Duration),
    #[error("{0}")]
    Other(String),
}

/// Failure to create a session for a launch command.
#[derive(Debug, Error)]
#[error("Failed to create session for '{command}': {source}")]
pub struct SessionCreationError {
    pub command: String,
    #[source]
    pub source: ConnectError,
}

/// Failure of a single tool call.
#[derive(Debug, Error)]
#[error("Tool '{tool}' via '{command}' failed: {source}")]
pub struct ToolInvocationError {
    pub command: String,
    pub tool: String,
    #[source]
    pub source: ProtocolError,
}

/// Failure to close one transport during shutdown.
#[derive(Debug, Error)]
#[error("Failed to close transport for '{command}': {source}")]
pub struct TeardownError {
    pub command: String,
    #[source]
    pub source: TransportError,
}

/// Errors surfaced to callers of the tool adapter.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Creation(#[from] SessionCreationError),
    #[error(transparent)]
    Invocation(#[from] ToolInvocationError),
}
