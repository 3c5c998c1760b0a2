//! Core abstractions for MCP tool sessions.
//!
//! This crate provides the fundamental building blocks:
//! - `protocol` - JSON-RPC 2.0 / MCP wire types
//! - `ServerParams` and `ManagerConfig` - launch and timeout configuration
//! - `ToolSession`, `Transport` and `Connector` traits
//! - The error taxonomy shared by transports and the session manager

pub mod config;
pub mod error;
pub mod protocol;
pub mod traits;

pub use config::{ManagerConfig, ServerParams, StdioConfig};
pub use error::{
    ConnectError, ManagerError, ProtocolError, SessionCreationError, TeardownError,
    ToolInvocationError, TransportError,
};
pub use protocol::{CallToolResult, Content, InitializeResult, ServerInfo, ToolDescriptor};
pub use traits::{Connection, Connector, ToolSession, Transport};
