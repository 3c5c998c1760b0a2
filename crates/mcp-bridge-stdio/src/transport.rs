//! Child-process transport and connector.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use command_group::{AsyncCommandGroup, AsyncGroupChild};
use mcp_bridge_core::{
    ConnectError, Connection, Connector, ServerParams, StdioConfig, Transport, TransportError,
    protocol::ClientInfo,
};
use tokio::task::JoinHandle;

use crate::{
    command::{CommandParts, build_command},
    peer::StdioPeer,
};

/// A spawned tool server: its process group and the session reader task.
pub struct StdioTransport {
    child: AsyncGroupChild,
    peer: StdioPeer,
    reader: Option<JoinHandle<()>>,
    pid: Option<u32>,
}

impl StdioTransport {
    /// Process id of the group leader, if it is still known.
    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn stop_reader(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.peer.fail_pending();
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn close(&mut self, grace: Duration) -> Result<(), TransportError> {
        self.peer.close_writer().await;

        let exited = match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(pid = ?self.pid, %status, "Tool server exited");
                true
            }
            Ok(Err(e)) => return Err(TransportError::Io(e)),
            Err(_) => false,
        };

        if exited {
            // Stragglers the server left behind share its group.
            if let Err(e) = self.child.start_kill() {
                tracing::trace!(pid = ?self.pid, "No process group left to signal: {e}");
            }
        } else {
            tracing::debug!(pid = ?self.pid, "Tool server did not exit, killing process group");
            self.child.kill().await.map_err(TransportError::Kill)?;
            self.child.wait().await?;
        }

        self.stop_reader();
        Ok(())
    }

    fn abort(&mut self) {
        // Signal the whole group; dropping the child would only reach the leader.
        if let Err(e) = self.child.start_kill() {
            tracing::debug!(pid = ?self.pid, "Failed to kill process group: {e}");
        }
        self.stop_reader();
    }

    fn describe(&self) -> String {
        self.pid
            .map_or_else(|| "exited process".to_string(), |pid| format!("pid {pid}"))
    }
}

/// Opens sessions by spawning tool servers that speak MCP on stdin/stdout.
#[derive(Debug, Clone, Default)]
pub struct StdioConnector {
    config: StdioConfig,
}

impl StdioConnector {
    #[must_use]
    pub const fn new(config: StdioConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub const fn config(&self) -> &StdioConfig {
        &self.config
    }
}

#[async_trait]
impl Connector for StdioConnector {
    async fn connect(&self, params: &ServerParams) -> Result<Connection, ConnectError> {
        let (executable, args) = CommandParts::from(params)
            .into_resolved(params.cwd.as_deref())
            .await?;
        let mut cmd = build_command(&executable, &args, params, &self.config);

        let mut child = cmd.group_spawn().map_err(ConnectError::Spawn)?;
        let pid = child.id();

        let stdin = child.inner().stdin.take();
        let stdout = child.inner().stdout.take();
        let (Some(stdin), Some(stdout)) = (stdin, stdout) else {
            if let Err(e) = child.kill().await {
                tracing::debug!("Failed to kill child without stdio: {e}");
            }
            return Err(ConnectError::MissingStdio);
        };

        tracing::debug!(
            executable = %executable.display(),
            pid = ?pid,
            "Spawned tool server"
        );

        let (peer, reader) = StdioPeer::spawn(
            stdin,
            stdout,
            ClientInfo {
                name: self.config.client_name.clone(),
                version: self.config.client_version.clone(),
            },
            self.config.protocol_version.clone(),
        );

        let transport = StdioTransport {
            child,
            peer: peer.clone(),
            reader: Some(reader),
            pid,
        };

        Ok(Connection::new(Arc::new(peer), Box::new(transport)))
    }
}
