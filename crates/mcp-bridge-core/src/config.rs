//! Launch parameters and manager configuration.

use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::ConnectError;

/// How to launch one tool server process.
///
/// Built from a launch command string such as `"python echo_server.py"`.
/// The string is split on whitespace: the first token is the executable,
/// the rest are positional arguments. Quoting is not supported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerParams {
    /// Executable name or path.
    pub command: String,
    /// Positional arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables for the child.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Working directory for the child.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

impl ServerParams {
    /// Parse a whitespace-delimited launch command.
    ///
    /// # Errors
    /// Returns `ConnectError::EmptyCommand` if the string has no tokens.
    pub fn parse(command_line: &str) -> Result<Self, ConnectError> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let command = parts.next().ok_or(ConnectError::EmptyCommand)?;
        Ok(Self {
            command,
            args: parts.collect(),
            env: BTreeMap::new(),
            cwd: None,
        })
    }

    /// Add environment variables, keeping existing keys.
    #[must_use]
    pub fn with_env<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in vars {
            self.env.entry(k.into()).or_insert_with(|| v.into());
        }
        self
    }

    /// Set the working directory if none is set yet.
    #[must_use]
    pub fn with_default_cwd(mut self, cwd: Option<PathBuf>) -> Self {
        if self.cwd.is_none() {
            self.cwd = cwd;
        }
        self
    }
}

const fn default_handshake_timeout_ms() -> u64 {
    30_000
}

#[allow(clippy::unnecessary_wraps)]
const fn default_call_timeout_ms() -> Option<u64> {
    Some(60_000)
}

const fn default_close_timeout_ms() -> u64 {
    5_000
}

/// Session manager configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Upper bound on spawn plus handshake.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Upper bound on a single tool call; `None` waits indefinitely.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: Option<u64>,
    /// Upper bound on closing one transport during shutdown.
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,
    /// Environment applied to every spawned server.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Working directory for every spawned server.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: default_handshake_timeout_ms(),
            call_timeout_ms: default_call_timeout_ms(),
            close_timeout_ms: default_close_timeout_ms(),
            env: BTreeMap::new(),
            cwd: None,
        }
    }
}

impl ManagerConfig {
    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout_ms = duration_ms(timeout);
        self
    }

    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout_ms = timeout.map(duration_ms);
        self
    }

    #[must_use]
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout_ms = duration_ms(timeout);
        self
    }

    /// Set an environment variable for every spawned server.
    pub fn set_env(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.env.insert(key.into(), value.into());
    }

    #[must_use]
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    #[must_use]
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    #[must_use]
    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }

    #[must_use]
    pub const fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    /// Time a server gets to exit after stdin is closed before it is killed.
    ///
    /// Half of `close_timeout`, leaving the rest for the kill and reap.
    #[must_use]
    pub const fn exit_grace(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms / 2)
    }

    /// Launch parameters for `command` with the manager-wide env and cwd applied.
    ///
    /// # Errors
    /// Returns `ConnectError::EmptyCommand` if `command` has no tokens.
    pub fn server_params(&self, command: &str) -> Result<ServerParams, ConnectError> {
        Ok(ServerParams::parse(command)?
            .with_env(self.env.clone())
            .with_default_cwd(self.cwd.clone()))
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Settings for the stdio transport's side of the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StdioConfig {
    pub client_name: String,
    pub client_version: String,
    pub protocol_version: String,
    /// Forward server stderr to ours; otherwise it is discarded.
    pub inherit_stderr: bool,
}

impl Default for StdioConfig {
    fn default() -> Self {
        Self {
            client_name: "mcp-bridge".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            protocol_version: crate::protocol::LATEST_PROTOCOL_VERSION.to_string(),
            inherit_stderr: true,
        }
    }
}
