//! Line-delimited JSON-RPC peer implementing an MCP client session.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex as StdMutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use mcp_bridge_core::{
    CallToolResult, InitializeResult, ProtocolError, ToolDescriptor, ToolSession,
    protocol::{
        ClientInfo, Incoming, InitializeParams, ListToolsResult, Notification, Request, Response,
        RpcError, methods,
    },
};
use serde::Serialize;
use serde_json::{Map, Value, json};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    sync::{Mutex, oneshot},
    task::JoinHandle,
};

type Writer = Box<dyn AsyncWrite + Send + Unpin>;
type Waiter = oneshot::Sender<Result<Value, RpcError>>;

#[derive(Default)]
struct Pending {
    waiters: HashMap<u64, Waiter>,
    closed: bool,
}

struct Inner {
    writer: Mutex<Option<Writer>>,
    pending: StdMutex<Pending>,
    next_id: AtomicU64,
    client_info: ClientInfo,
    protocol_version: String,
}

impl Inner {
    fn pending(&self) -> std::sync::MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes a waiter if its call is abandoned before the response arrives.
struct WaiterGuard<'a> {
    inner: &'a Inner,
    id: u64,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.inner.pending().waiters.remove(&self.id);
    }
}

/// Client side of an MCP session over a pair of byte streams.
///
/// Requests carry increasing ids; a background reader task matches
/// responses to waiting callers by id, so concurrent calls on one peer
/// may complete in any order.
#[derive(Clone)]
pub struct StdioPeer {
    inner: Arc<Inner>,
}

impl StdioPeer {
    /// Spawn a new peer over `writer` (server stdin) and `reader` (server stdout).
    ///
    /// This starts a background task that reads from `reader` until EOF.
    #[must_use]
    pub fn spawn(
        writer: impl AsyncWrite + Send + Unpin + 'static,
        reader: impl AsyncRead + Send + Unpin + 'static,
        client_info: ClientInfo,
        protocol_version: impl Into<String>,
    ) -> (Self, JoinHandle<()>) {
        let peer = Self {
            inner: Arc::new(Inner {
                writer: Mutex::new(Some(Box::new(writer))),
                pending: StdMutex::new(Pending::default()),
                next_id: AtomicU64::new(1),
                client_info,
                protocol_version: protocol_version.into(),
            }),
        };

        let reader_peer = peer.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = reader_peer.read_loop(reader).await {
                tracing::debug!("Session reader loop error: {e}");
            }
            reader_peer.fail_pending();
        });

        (peer, handle)
    }

    async fn read_loop(
        &self,
        reader: impl AsyncRead + Send + Unpin,
    ) -> Result<(), ProtocolError> {
        let mut reader = BufReader::new(reader);
        let mut buffer = Vec::new();

        loop {
            buffer.clear();
            if reader.read_until(b'\n', &mut buffer).await? == 0 {
                tracing::debug!("Session stream reached EOF");
                return Ok(());
            }
            let Ok(line) = std::str::from_utf8(&buffer) else {
                tracing::debug!(bytes = buffer.len(), "Skipping non-UTF-8 output line");
                continue;
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match Incoming::parse(line) {
                Some(Incoming::Response { id, outcome }) => self.complete(id, outcome),
                Some(Incoming::Request { id, method, .. }) => {
                    self.answer_server_request(id, &method).await;
                }
                Some(Incoming::Notification { method, .. }) => {
                    tracing::debug!(%method, "Ignoring server notification");
                }
                None => {
                    tracing::debug!(line, "Skipping non-protocol output");
                }
            }
        }
    }

    fn complete(&self, id: u64, outcome: Result<Value, RpcError>) {
        let waiter = self.inner.pending().waiters.remove(&id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => tracing::debug!(id, "Response for unknown or abandoned request"),
        }
    }

    async fn answer_server_request(&self, id: Value, method: &str) {
        let response = if method == methods::PING {
            Response::success(id, json!({}))
        } else {
            tracing::debug!(%method, "Rejecting unsupported server request");
            Response::failure(id, RpcError::method_not_found(method))
        };
        if let Err(e) = self.send_json(&response).await {
            tracing::debug!("Failed to answer server request: {e}");
        }
    }

    /// Mark the peer closed and fail every outstanding call.
    pub(crate) fn fail_pending(&self) {
        let mut pending = self.inner.pending();
        pending.closed = true;
        // Dropping the senders wakes each waiter with `Closed`.
        pending.waiters.clear();
    }

    async fn send_json<T: Serialize + Sync>(&self, message: &T) -> Result<(), ProtocolError> {
        let json = serde_json::to_string(message)?;
        let mut guard = self.inner.writer.lock().await;
        let writer = guard.as_mut().ok_or(ProtocolError::Closed)?;
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }

    /// Send a request and wait for its response.
    ///
    /// # Errors
    /// Returns `Closed` if the stream ends first, `Remote` for JSON-RPC errors.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, ProtocolError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending();
            if pending.closed {
                return Err(ProtocolError::Closed);
            }
            pending.waiters.insert(id, tx);
        }
        let _guard = WaiterGuard {
            inner: &self.inner,
            id,
        };

        tracing::trace!(id, %method, "Sending request");
        self.send_json(&Request::new(id, method, params)).await?;

        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(ProtocolError::Closed),
        }
    }

    /// Send a notification.
    ///
    /// # Errors
    /// Returns error if write fails.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ProtocolError> {
        self.send_json(&Notification::new(method, params)).await
    }

    /// Close the write half, signalling EOF to the server.
    pub async fn close_writer(&self) {
        if let Some(mut writer) = self.inner.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!("Failed to shut down session writer: {e}");
            }
        }
    }

    /// Whether the read side has ended.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.pending().closed
    }
}

#[async_trait]
impl ToolSession for StdioPeer {
    async fn initialize(&self) -> Result<InitializeResult, ProtocolError> {
        let params = InitializeParams::new(
            self.inner.protocol_version.clone(),
            self.inner.client_info.clone(),
        );
        let value = self
            .request(methods::INITIALIZE, Some(serde_json::to_value(params)?))
            .await?;
        let result: InitializeResult = serde_json::from_value(value)?;
        self.notify(methods::INITIALIZED, None).await?;
        Ok(result)
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Map<String, Value>,
    ) -> Result<CallToolResult, ProtocolError> {
        let value = self
            .request(
                methods::TOOLS_CALL,
                Some(json!({ "name": name, "arguments": arguments })),
            )
            .await?;
        let result: CallToolResult = serde_json::from_value(value)?;
        if result.is_error {
            return Err(ProtocolError::ToolFailed {
                message: result.text_content(),
            });
        }
        Ok(result)
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ProtocolError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let page: ListToolsResult =
                serde_json::from_value(self.request(methods::TOOLS_LIST, params).await?)?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if Some(&next) != cursor.as_ref() => cursor = Some(next),
                _ => return Ok(tools),
            }
        }
    }
}
