//! Session manager: one live MCP session per launch command.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError},
};

use mcp_bridge_core::{
    CallToolResult, ConnectError, Connector, InitializeResult, ManagerConfig, ProtocolError,
    SessionCreationError, TeardownError, ToolDescriptor, ToolInvocationError, ToolSession,
    Transport, TransportError,
};
use serde_json::{Map, Value};
use tokio::{
    runtime::RuntimeFlavor,
    sync::Mutex,
    time::{Instant, timeout, timeout_at},
};
use uuid::Uuid;

/// An initialized session, cheap to clone.
///
/// Two handles are equal only if they refer to the same live session;
/// a session re-created after shutdown compares unequal to the old one.
#[derive(Clone)]
pub struct SessionHandle {
    id: Uuid,
    command: Arc<str>,
    server: Arc<InitializeResult>,
    session: Arc<dyn ToolSession>,
}

impl SessionHandle {
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Launch command this session was created for.
    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Handshake result reported by the server.
    #[must_use]
    pub fn server_info(&self) -> &InitializeResult {
        &self.server
    }
}

impl PartialEq for SessionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for SessionHandle {}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("command", &self.command)
            .field("server", &self.server.server_info.name)
            .finish_non_exhaustive()
    }
}

/// A registered session and the transport backing it.
struct LiveSession {
    handle: SessionHandle,
    transport: Box<dyn Transport>,
}

#[derive(Default)]
struct Registry {
    /// Creation guards, one per command, created on first use.
    guards: HashMap<String, Arc<Mutex<()>>>,
    /// Only sessions whose handshake completed.
    sessions: HashMap<String, LiveSession>,
}

/// Outcome of `release_all`.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Commands whose transport closed cleanly.
    pub closed: Vec<String>,
    /// Per-command close failures.
    pub failed: Vec<TeardownError>,
}

impl ShutdownReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Registry of MCP sessions keyed by launch command.
///
/// `acquire` spawns at most one server per distinct command and reuses it
/// afterwards. Different commands never wait on each other. Everything is
/// torn down by `release_all`, which the host calls before exiting.
pub struct SessionManager<C>
where
    C: Connector,
{
    connector: C,
    config: ManagerConfig,
    registry: StdMutex<Registry>,
}

impl<C> SessionManager<C>
where
    C: Connector,
{
    /// Create a session manager with default configuration.
    #[must_use]
    pub fn new(connector: C) -> Self {
        Self::with_config(connector, ManagerConfig::default())
    }

    #[must_use]
    pub fn with_config(connector: C, config: ManagerConfig) -> Self {
        tracing::debug!(?config, "Session manager initialized");
        Self {
            connector,
            config,
            registry: StdMutex::new(Registry::default()),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &ManagerConfig {
        &self.config
    }

    #[must_use]
    pub const fn connector(&self) -> &C {
        &self.connector
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn guard_for(&self, command: &str) -> Arc<Mutex<()>> {
        let mut registry = self.registry();
        Arc::clone(registry.guards.entry(command.to_string()).or_default())
    }

    fn lookup(&self, command: &str) -> Option<SessionHandle> {
        self.registry()
            .sessions
            .get(command)
            .map(|live| live.handle.clone())
    }

    /// Get the session for `command`, creating it on first use.
    ///
    /// Concurrent callers for the same command wait for the first caller's
    /// attempt; if that attempt failed, the next waiter tries again.
    /// Dropping the returned future releases the command's guard.
    ///
    /// # Errors
    /// Returns `SessionCreationError` if the command is empty, the process
    /// cannot be spawned, or the handshake fails or times out. Nothing is
    /// registered for `command` in that case.
    pub async fn acquire(&self, command: &str) -> Result<SessionHandle, SessionCreationError> {
        let guard = self.guard_for(command);
        let _held = guard.lock().await;

        if let Some(handle) = self.lookup(command) {
            tracing::debug!(%command, session = %handle.id, "Reusing existing session");
            return Ok(handle);
        }

        tracing::info!(%command, "Creating new session");
        match self.create(command).await {
            Ok(live) => {
                let handle = live.handle.clone();
                tracing::info!(
                    %command,
                    session = %handle.id,
                    transport = %live.transport.describe(),
                    server = %handle.server.server_info.name,
                    "Session created and initialized"
                );
                self.registry().sessions.insert(command.to_string(), live);
                Ok(handle)
            }
            Err(source) => {
                tracing::error!(%command, error = %source, "Failed to create session");
                Err(SessionCreationError {
                    command: command.to_string(),
                    source,
                })
            }
        }
    }

    async fn create(&self, command: &str) -> Result<LiveSession, ConnectError> {
        let params = self.config.server_params(command)?;
        let limit = self.config.handshake_timeout();
        let deadline = Instant::now() + limit;

        let mut conn = timeout_at(deadline, self.connector.connect(&params))
            .await
            .map_err(|_| ConnectError::HandshakeTimeout(limit))??;

        let handshake = match timeout_at(deadline, conn.session.initialize()).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(ConnectError::Handshake(e)),
            Err(_) => Err(ConnectError::HandshakeTimeout(limit)),
        };

        match handshake {
            Ok(server) => Ok(LiveSession {
                handle: SessionHandle {
                    id: Uuid::new_v4(),
                    command: Arc::from(command),
                    server: Arc::new(server),
                    session: conn.session,
                },
                transport: conn.transport,
            }),
            Err(e) => {
                if let Err(close_err) = self.close_transport(conn.transport.as_mut()).await {
                    tracing::warn!(
                        %command,
                        error = %close_err,
                        "Failed to close transport after session creation failure"
                    );
                }
                Err(e)
            }
        }
    }

    async fn close_transport(&self, transport: &mut dyn Transport) -> Result<(), TransportError> {
        let limit = self.config.close_timeout();
        let closed = timeout(limit, transport.close(self.config.exit_grace())).await;
        closed.unwrap_or_else(|_| {
            tracing::warn!(
                transport = %transport.describe(),
                "Transport close timed out, aborting"
            );
            transport.abort();
            Err(TransportError::CloseTimeout(limit))
        })
    }

    /// Call `tool` on an acquired session.
    ///
    /// The configured call timeout applies; there is no retry.
    ///
    /// # Errors
    /// Returns `ToolInvocationError` if the transport is closed, the server
    /// reports an error, or the call times out.
    pub async fn invoke(
        &self,
        session: &SessionHandle,
        tool: &str,
        arguments: Map<String, Value>,
    ) -> Result<CallToolResult, ToolInvocationError> {
        tracing::debug!(command = %session.command, %tool, "Invoking tool");
        let call = session.session.call_tool(tool, arguments);
        let outcome = match self.config.call_timeout() {
            Some(limit) => timeout(limit, call)
                .await
                .unwrap_or(Err(ProtocolError::Timeout(limit))),
            None => call.await,
        };
        outcome.map_err(|source| ToolInvocationError {
            command: session.command.to_string(),
            tool: tool.to_string(),
            source,
        })
    }

    /// List the tools advertised on an acquired session.
    ///
    /// # Errors
    /// Returns `ToolInvocationError` (with tool `tools/list`) on failure.
    pub async fn list_tools(
        &self,
        session: &SessionHandle,
    ) -> Result<Vec<ToolDescriptor>, ToolInvocationError> {
        let list = session.session.list_tools();
        let outcome = match self.config.call_timeout() {
            Some(limit) => timeout(limit, list)
                .await
                .unwrap_or(Err(ProtocolError::Timeout(limit))),
            None => list.await,
        };
        outcome.map_err(|source| ToolInvocationError {
            command: session.command.to_string(),
            tool: mcp_bridge_core::protocol::methods::TOOLS_LIST.to_string(),
            source,
        })
    }

    /// Close every registered transport and clear the registry.
    ///
    /// A failing close is logged and reported, and never stops the others.
    /// The registry is cleared regardless. Calling this on an empty
    /// manager does nothing.
    pub async fn release_all(&self) -> ShutdownReport {
        let sessions: Vec<(String, LiveSession)> = {
            let mut registry = self.registry();
            registry.guards.clear();
            registry.sessions.drain().collect()
        };

        if sessions.is_empty() {
            return ShutdownReport::default();
        }
        tracing::info!(count = sessions.len(), "Closing all sessions");

        let closes = sessions.into_iter().map(|(command, mut live)| async move {
            tracing::debug!(%command, transport = %live.transport.describe(), "Closing transport");
            let result = self.close_transport(live.transport.as_mut()).await;
            (command, result)
        });

        let mut report = ShutdownReport::default();
        for (command, result) in futures::future::join_all(closes).await {
            match result {
                Ok(()) => report.closed.push(command),
                Err(source) => {
                    tracing::warn!(%command, error = %source, "Failed to close transport");
                    report.failed.push(TeardownError { command, source });
                }
            }
        }
        report.closed.sort();
        tracing::info!(
            closed = report.closed.len(),
            failed = report.failed.len(),
            "All sessions released"
        );
        report
    }

    /// Synchronous shutdown for hosts that are not inside async code.
    ///
    /// Reuses the current Tokio runtime from a helper thread when one is
    /// running, otherwise builds a transient current-thread runtime for the
    /// cleanup.
    ///
    /// # Errors
    /// Returns error if a transient runtime cannot be built, or if called
    /// from a current-thread runtime, which could not drive the cleanup
    /// while blocked. Sessions stay registered in that case.
    pub fn release_all_blocking(&self) -> std::io::Result<ShutdownReport> {
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            if handle.runtime_flavor() == RuntimeFlavor::CurrentThread {
                return Err(std::io::Error::other(
                    "release_all_blocking cannot run on a current-thread runtime; await release_all instead",
                ));
            }
            let report = std::thread::scope(|s| {
                s.spawn(|| handle.block_on(self.release_all()))
                    .join()
                    .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
            });
            Ok(report)
        } else {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            Ok(rt.block_on(self.release_all()))
        }
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.registry().sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registry().sessions.is_empty()
    }

    /// Whether an initialized session exists for `command`.
    #[must_use]
    pub fn contains(&self, command: &str) -> bool {
        self.registry().sessions.contains_key(command)
    }

    /// Commands with a live session, sorted.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        let mut commands: Vec<String> = self.registry().sessions.keys().cloned().collect();
        commands.sort();
        commands
    }
}

#[cfg(all(test, feature = "loopback"))]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    use super::*;
    use crate::loopback::LoopbackConnector;

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_second_acquire_reuses_session() {
        let manager = SessionManager::new(LoopbackConnector::new());

        let s1 = assert_ok!(manager.acquire("python echo_server.py").await);
        let again = assert_ok!(manager.acquire("python echo_server.py").await);

        assert_eq!(s1, again);
        assert_eq!(manager.connector().stats().connects(), 1);
        assert_eq!(manager.commands(), vec!["python echo_server.py"]);
    }

    #[tokio::test]
    async fn test_concurrent_acquire_spawns_once() {
        let manager = SessionManager::new(LoopbackConnector::new());

        let (a, b) = tokio::join!(manager.acquire("echo"), manager.acquire("echo"));

        assert_eq!(assert_ok!(a), assert_ok!(b));
        assert_eq!(manager.connector().stats().connects(), 1);
        assert_eq!(manager.connector().stats().handshakes(), 1);
    }

    #[tokio::test]
    async fn test_distinct_commands_do_not_block_each_other() {
        let manager = Arc::new(SessionManager::new(
            LoopbackConnector::new().stall_handshake("slow"),
        ));

        let slow = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.acquire("slow server").await }
        });
        tokio::task::yield_now().await;

        let fast = timeout(Duration::from_secs(1), manager.acquire("fast server")).await;
        assert_ok!(assert_ok!(fast));
        assert!(!slow.is_finished());
        slow.abort();
    }

    #[tokio::test]
    async fn test_failed_handshake_leaves_no_entry_and_retries_fresh() {
        let manager = SessionManager::new(LoopbackConnector::new().reject_handshake("broken"));

        let err = assert_err!(manager.acquire("broken --flag").await);
        assert_eq!(err.command, "broken --flag");
        assert!(matches!(err.source, ConnectError::Handshake(_)));
        assert!(!manager.contains("broken --flag"));
        assert!(manager.is_empty());
        // The half-open transport was released.
        assert_eq!(manager.connector().stats().closes(), 1);

        assert_err!(manager.acquire("broken --flag").await);
        assert_eq!(manager.connector().stats().connects(), 2);
    }

    #[tokio::test]
    async fn test_handshake_timeout_rolls_back() {
        let config = ManagerConfig::default().with_handshake_timeout(Duration::from_millis(50));
        let manager =
            SessionManager::with_config(LoopbackConnector::new().stall_handshake("stuck"), config);

        let err = assert_err!(manager.acquire("stuck").await);
        assert!(matches!(err.source, ConnectError::HandshakeTimeout(_)));
        assert!(manager.is_empty());
        assert_eq!(manager.connector().stats().closes(), 1);
    }

    #[tokio::test]
    async fn test_caller_timeout_releases_guard() {
        let manager = SessionManager::new(LoopbackConnector::new().stall_handshake("stuck"));

        let attempt = timeout(Duration::from_millis(50), manager.acquire("stuck")).await;
        assert!(attempt.is_err());

        let guard = manager.guard_for("stuck");
        assert!(guard.try_lock().is_ok());
        assert!(!manager.contains("stuck"));
    }

    #[tokio::test]
    async fn test_empty_command_is_a_creation_error() {
        let manager = SessionManager::new(LoopbackConnector::new());
        let err = assert_err!(manager.acquire("   ").await);
        assert!(matches!(err.source, ConnectError::EmptyCommand));
        assert_eq!(manager.connector().stats().connects(), 0);
    }

    #[tokio::test]
    async fn test_invoke_returns_result_and_shares_session_across_tools() {
        let manager = SessionManager::new(LoopbackConnector::new());
        let session = assert_ok!(manager.acquire("python echo_server.py").await);

        let echoed = assert_ok!(
            manager
                .invoke(&session, "echo_tool", args(json!({"message": "hi"})))
                .await
        );
        assert!(echoed.text_content().contains("hi"));

        let other = assert_ok!(manager.acquire("python echo_server.py").await);
        assert_ok!(manager.invoke(&other, "reverse_tool", Map::new()).await);
        assert_eq!(manager.connector().stats().connects(), 1);
        assert_eq!(manager.connector().stats().calls(), 2);
    }

    #[tokio::test]
    async fn test_invoke_after_release_fails_closed() {
        let manager = SessionManager::new(LoopbackConnector::new());
        let session = assert_ok!(manager.acquire("echo").await);
        manager.release_all().await;

        let err = assert_err!(manager.invoke(&session, "echo_tool", Map::new()).await);
        assert_eq!(err.tool, "echo_tool");
        assert!(matches!(err.source, ProtocolError::Closed));
    }

    #[tokio::test]
    async fn test_release_all_is_idempotent_and_recreates() {
        let manager = SessionManager::new(LoopbackConnector::new());
        let s1 = assert_ok!(manager.acquire("echo").await);

        let report = manager.release_all().await;
        assert!(report.is_clean());
        assert_eq!(report.closed, vec!["echo"]);
        assert!(manager.is_empty());

        let second = manager.release_all().await;
        assert!(second.closed.is_empty() && second.is_clean());

        let s2 = assert_ok!(manager.acquire("echo").await);
        assert_ne!(s1, s2);
        assert_eq!(manager.connector().stats().connects(), 2);
    }

    #[tokio::test]
    async fn test_teardown_failure_does_not_stop_others() {
        let manager = SessionManager::new(LoopbackConnector::new().fail_close("flaky"));
        for command in ["alpha", "flaky", "omega"] {
            assert_ok!(manager.acquire(command).await);
        }

        let report = manager.release_all().await;

        assert_eq!(report.closed, vec!["alpha", "omega"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].command, "flaky");
        assert_eq!(manager.connector().stats().close_attempts(), 3);
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_close_timeout_aborts_stuck_transport() {
        let config = ManagerConfig::default().with_close_timeout(Duration::from_millis(50));
        let manager =
            SessionManager::with_config(LoopbackConnector::new().stall_close("stuck"), config);
        let session = assert_ok!(manager.acquire("stuck server").await);
        assert_ok!(manager.acquire("fine").await);

        let report = timeout(Duration::from_secs(2), manager.release_all()).await;
        let report = assert_ok!(report);

        assert_eq!(report.closed, vec!["fine"]);
        assert_eq!(report.failed.len(), 1);
        assert!(matches!(
            report.failed[0].source,
            TransportError::CloseTimeout(limit) if limit == Duration::from_millis(50)
        ));
        assert_eq!(manager.connector().stats().aborts(), 1);

        // The aborted session is unusable afterwards.
        let err = assert_err!(manager.invoke(&session, "echo_tool", Map::new()).await);
        assert!(matches!(err.source, ProtocolError::Closed));
    }

    #[tokio::test]
    async fn test_list_tools_on_session() {
        let manager = SessionManager::new(LoopbackConnector::new());
        let session = assert_ok!(manager.acquire("echo").await);
        let tools = assert_ok!(manager.list_tools(&session).await);
        assert_eq!(tools[0].name, "echo_tool");
    }

    #[test]
    fn test_release_all_blocking_without_runtime() {
        let manager = SessionManager::new(LoopbackConnector::new());
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(manager.acquire("echo")).unwrap();
        drop(rt);

        let report = manager.release_all_blocking().unwrap();
        assert_eq!(report.closed, vec!["echo"]);
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_release_all_blocking_refuses_current_thread_runtime() {
        let manager = SessionManager::new(LoopbackConnector::new());
        assert_ok!(manager.acquire("echo").await);

        let err = manager.release_all_blocking().unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::Other);
        assert!(manager.contains("echo"));

        let report = manager.release_all().await;
        assert_eq!(report.closed, vec!["echo"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_release_all_blocking_inside_runtime() {
        let manager = SessionManager::new(LoopbackConnector::new());
        assert_ok!(manager.acquire("echo").await);

        let report = tokio::task::block_in_place(|| manager.release_all_blocking()).unwrap();
        assert_eq!(report.closed, vec!["echo"]);
    }
}
