//! Session orchestration for MCP tool servers.
//!
//! Provides:
//! - `SessionManager` - One live session per launch command, with shutdown
//! - `ToolAdapter` - Callable façade over a manager, command and tool name
//! - `LoopbackConnector` - In-process transport for tests (feature: loopback)

pub mod adapter;
pub mod manager;

#[cfg(feature = "loopback")]
pub mod loopback;

pub use adapter::{CallableTool, ToolAdapter};
pub use manager::{SessionHandle, SessionManager, ShutdownReport};

#[cfg(feature = "loopback")]
pub use loopback::{LoopbackConnector, LoopbackStats};
