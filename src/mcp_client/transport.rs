//! JSON-RPC transport over a server's byte channel.
//!
//! Handles low-level communication with MCP servers:
//! - Writing newline-delimited JSON-RPC frames to the server's stdin
//! - A background reader task that routes responses to waiting callers by id
//! - Answering the few server-initiated requests a client must handle (`ping`)
//!
//! Requests are multiplexed: any number of callers may have a request in
//! flight at once, and responses may arrive in any order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, Mutex as TokioMutex};
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::types::{error_codes, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

// ─── Shared State ────────────────────────────────────────────────────────────

/// Why the transport stopped accepting requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The server closed its stdout.
    Eof,
    /// Reading from the server failed.
    ReadError(String),
    /// The server sent a frame that is not valid JSON-RPC 2.0.
    ProtocolViolation(String),
    /// `close()` was called locally.
    Closed,
}

/// Pending requests and the closed flag live under one lock so a request can
/// never be registered after the reader has drained the table.
#[derive(Default)]
struct Shared {
    pending: HashMap<u64, oneshot::Sender<JsonRpcResponse>>,
    closed: Option<CloseReason>,
}

impl Shared {
    fn close(&mut self, reason: CloseReason) {
        if self.closed.is_none() {
            self.closed = Some(reason);
        }
        // Dropping the senders wakes every waiter with a RecvError.
        self.pending.clear();
    }
}

fn lock_shared(shared: &Mutex<Shared>) -> std::sync::MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Removes a pending entry when the waiting future is dropped (timeout or
/// cancellation), so late responses are discarded instead of leaking.
struct PendingGuard<'a> {
    shared: &'a Mutex<Shared>,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock_shared(self.shared).pending.remove(&self.id);
    }
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// Bi-directional, multiplexed JSON-RPC transport.
pub struct StdioTransport {
    server_name: String,
    next_id: AtomicU64,
    writer: Arc<TokioMutex<BoxedWriter>>,
    shared: Arc<Mutex<Shared>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl StdioTransport {
    /// Create a transport from the server's output (`reader`) and input
    /// (`writer`) streams and start the background reader task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new<R, W>(server_name: &str, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let writer: Arc<TokioMutex<BoxedWriter>> = Arc::new(TokioMutex::new(Box::new(writer)));
        let shared = Arc::new(Mutex::new(Shared::default()));

        let reader_task = tokio::spawn(read_loop(
            server_name.to_string(),
            reader,
            Arc::clone(&shared),
            Arc::clone(&writer),
        ));

        Self {
            server_name: server_name.to_string(),
            next_id: AtomicU64::new(1),
            writer,
            shared,
            reader_task: Mutex::new(Some(reader_task)),
        }
    }

    /// Allocate the next correlation id for this channel.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Send a JSON-RPC request and wait for the matching response.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        let id = self.next_id();
        self.request_with_id(id, method, params).await
    }

    /// Send a request under a caller-allocated id and wait for its response.
    ///
    /// Dropping the returned future abandons the request: the pending entry
    /// is removed and a late response is discarded.
    pub async fn request_with_id(
        &self,
        id: u64,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut shared = lock_shared(&self.shared);
            if let Some(reason) = shared.closed.clone() {
                return Err(self.closed_error(&reason));
            }
            shared.pending.insert(id, tx);
        }
        let _guard = PendingGuard {
            shared: &self.shared,
            id,
        };

        let req = JsonRpcRequest::new(id, method, params);
        self.write_frame(&req).await?;

        match rx.await {
            Ok(resp) => Ok(resp),
            Err(_) => {
                let reason = lock_shared(&self.shared)
                    .closed
                    .clone()
                    .unwrap_or(CloseReason::Closed);
                Err(self.closed_error(&reason))
            }
        }
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        if let Some(reason) = self.close_reason() {
            return Err(self.closed_error(&reason));
        }
        self.write_frame(&JsonRpcNotification::new(method, params))
            .await
    }

    /// The reason the transport closed, if it has.
    pub fn close_reason(&self) -> Option<CloseReason> {
        lock_shared(&self.shared).closed.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.close_reason().is_some()
    }

    /// Number of requests currently awaiting a response.
    pub fn pending_count(&self) -> usize {
        lock_shared(&self.shared).pending.len()
    }

    /// Stop the reader, fail pending requests, and close the write side.
    ///
    /// Safe to call more than once.
    pub async fn close(&self) {
        lock_shared(&self.shared).close(CloseReason::Closed);

        let task = self
            .reader_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }

        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    async fn write_frame<T: serde::Serialize>(&self, frame: &T) -> Result<(), McpError> {
        let mut json = serde_json::to_string(frame).map_err(|e| McpError::TransportError {
            server: self.server_name.clone(),
            reason: format!("failed to serialize frame: {e}"),
        })?;
        json.push('\n');

        let mut writer = self.writer.lock().await;
        writer
            .write_all(json.as_bytes())
            .await
            .map_err(|e| McpError::TransportError {
                server: self.server_name.clone(),
                reason: format!("failed to write to server: {e}"),
            })?;
        writer
            .flush()
            .await
            .map_err(|e| McpError::TransportError {
                server: self.server_name.clone(),
                reason: format!("failed to flush server input: {e}"),
            })
    }

    fn closed_error(&self, reason: &CloseReason) -> McpError {
        match reason {
            CloseReason::Eof => McpError::TransportError {
                server: self.server_name.clone(),
                reason: "server stdout closed (process may have exited)".into(),
            },
            CloseReason::ReadError(e) => McpError::TransportError {
                server: self.server_name.clone(),
                reason: format!("failed to read from server: {e}"),
            },
            CloseReason::ProtocolViolation(e) => McpError::ProtocolViolation {
                server: self.server_name.clone(),
                reason: e.clone(),
            },
            CloseReason::Closed => McpError::SessionClosed {
                name: self.server_name.clone(),
                reason: "transport closed".into(),
            },
        }
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        let task = self
            .reader_task
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

// ─── Reader Task ─────────────────────────────────────────────────────────────

/// A classified line from the server.
#[derive(Debug)]
enum Frame {
    Response(JsonRpcResponse),
    Request { id: serde_json::Value, method: String },
    Notification { method: String },
    /// Not JSON at all: stray log output on stdout.
    Noise,
    /// JSON, but not a JSON-RPC 2.0 message we can accept.
    Invalid(String),
}

fn classify_frame(line: &str) -> Frame {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
        return Frame::Noise;
    };

    let Some(obj) = value.as_object() else {
        return Frame::Invalid("frame is not a JSON object".into());
    };

    if obj.get("jsonrpc").and_then(|v| v.as_str()) != Some("2.0") {
        return Frame::Invalid("missing or unsupported \"jsonrpc\" version".into());
    }

    if let Some(method) = obj.get("method").and_then(|m| m.as_str()) {
        return match obj.get("id") {
            Some(id) if !id.is_null() => Frame::Request {
                id: id.clone(),
                method: method.to_string(),
            },
            _ => Frame::Notification {
                method: method.to_string(),
            },
        };
    }

    if !obj.contains_key("result") && !obj.contains_key("error") {
        return Frame::Invalid("frame has neither method, result nor error".into());
    }

    match serde_json::from_value::<JsonRpcResponse>(value) {
        Ok(resp) => Frame::Response(resp),
        Err(e) => Frame::Invalid(format!("malformed response: {e}")),
    }
}

async fn read_loop<R>(
    server_name: String,
    reader: R,
    shared: Arc<Mutex<Shared>>,
    writer: Arc<TokioMutex<BoxedWriter>>,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                tracing::debug!(server = %server_name, "server output closed");
                lock_shared(&shared).close(CloseReason::Eof);
                return;
            }
            Err(e) => {
                tracing::warn!(server = %server_name, error = %e, "failed to read server output");
                lock_shared(&shared).close(CloseReason::ReadError(e.to_string()));
                return;
            }
        };

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        match classify_frame(trimmed) {
            Frame::Response(resp) => {
                let waiter = lock_shared(&shared).pending.remove(&resp.id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(resp);
                    }
                    None => {
                        tracing::debug!(
                            server = %server_name,
                            id = resp.id,
                            "discarding response for abandoned request"
                        );
                    }
                }
            }
            Frame::Request { id, method } => {
                let reply = if method == "ping" {
                    serde_json::json!({"jsonrpc": "2.0", "id": id, "result": {}})
                } else {
                    serde_json::json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": {
                            "code": error_codes::METHOD_NOT_FOUND,
                            "message": format!("client does not support '{method}'"),
                        }
                    })
                };
                let mut json = reply.to_string();
                json.push('\n');
                let mut w = writer.lock().await;
                if let Err(e) = w.write_all(json.as_bytes()).await {
                    tracing::warn!(server = %server_name, error = %e, "failed to answer server request");
                }
                let _ = w.flush().await;
            }
            Frame::Notification { method } => {
                tracing::debug!(server = %server_name, method = %method, "server notification");
            }
            Frame::Noise => {
                tracing::debug!(server = %server_name, line = %trimmed, "skipping non-JSON output");
            }
            Frame::Invalid(reason) => {
                tracing::error!(
                    server = %server_name,
                    reason = %reason,
                    "protocol violation, closing channel"
                );
                lock_shared(&shared).close(CloseReason::ProtocolViolation(reason));
                return;
            }
        }
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::ServerError {
        code: error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
