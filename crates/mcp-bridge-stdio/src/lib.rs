//! Child-process stdio transport for MCP tool sessions.
//!
//! Provides:
//! - `StdioConnector` - Spawn a tool server and wrap its stdin/stdout in a session
//! - `StdioPeer` - Line-delimited JSON-RPC client with id-correlated responses
//! - Launch command resolution utilities

pub mod command;
pub mod peer;
pub mod transport;

pub use command::{CommandParts, resolve_executable_path};
pub use peer::StdioPeer;
pub use transport::{StdioConnector, StdioTransport};
