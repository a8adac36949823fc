//! Server sessions: one live channel to one tool server.
//!
//! A session owns the server process (when it spawned one), the multiplexed
//! JSON-RPC transport, and the tool manifest discovered during the handshake.
//!
//! State machine:
//!
//! ```text
//! Connecting ──handshake──▶ Ready ──timeouts──▶ Degraded
//!                             │                    │
//!                             └──close / fatal──▶ Closed ◀──┘
//! ```
//!
//! A Degraded session is replaced (not repaired) by the client: a reconnect
//! opens a fresh session for the same descriptor and the old one is closed.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::Mutex as TokioMutex;
use tokio_util::sync::CancellationToken;

use super::errors::McpError;
use super::transport::{extract_result, CloseReason, StdioTransport};
use super::types::{
    CallToolResult, InitializeResult, ListToolsResult, McpToolDefinition, ServerCapabilities,
    ServerDescriptor, ToolCallResult, ToolErrorKind, SUPPORTED_PROTOCOL_VERSIONS,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default timeout for the initialize handshake.
///
/// Servers launched through `npx` may download their package on first start.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Consecutive call timeouts after which a Ready session becomes Degraded.
pub const DEFAULT_DEGRADED_AFTER_TIMEOUTS: u32 = 3;

/// Timeout for graceful shutdown before force-killing.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on `tools/list` pages, guarding against a cursor loop.
const MAX_TOOL_PAGES: usize = 64;

/// Best-effort budget for writing a `notifications/cancelled` frame.
const CANCEL_NOTIFY_TIMEOUT: Duration = Duration::from_secs(1);

// ─── Options ─────────────────────────────────────────────────────────────────

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Ready,
    Degraded,
    Closed,
}

impl SessionState {
    /// Whether the session's tools should be offered to the model.
    pub fn is_usable(&self) -> bool {
        matches!(self, SessionState::Ready | SessionState::Degraded)
    }
}

/// Tunables applied to every session the client opens.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub handshake_timeout: Duration,
    pub degraded_after_timeouts: u32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            degraded_after_timeouts: DEFAULT_DEGRADED_AFTER_TIMEOUTS,
        }
    }
}

// ─── ServerSession ───────────────────────────────────────────────────────────

/// A live, handshaken connection to one tool server.
pub struct ServerSession {
    descriptor: ServerDescriptor,
    transport: StdioTransport,
    /// The child process, when this session spawned one.
    process: TokioMutex<Option<Child>>,
    state: Mutex<SessionState>,
    capabilities: ServerCapabilities,
    /// Tool definitions received during the handshake.
    tools: Vec<McpToolDefinition>,
    options: SessionOptions,
    consecutive_timeouts: AtomicU32,
    /// Requests given up on, by timeout or caller cancellation.
    abandoned_requests: AtomicU64,
}

impl ServerSession {
    /// Launch the server process and perform the handshake.
    ///
    /// Fails with `SpawnFailed` if the process cannot be started and with
    /// `HandshakeFailed` if discovery fails, times out, or negotiates an
    /// unsupported protocol version.
    pub async fn open(
        descriptor: ServerDescriptor,
        options: SessionOptions,
    ) -> Result<Self, McpError> {
        let name = descriptor.name.clone();
        let config = &descriptor.config;

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);
        for (key, value) in &config.env {
            cmd.env(key, value);
        }
        if let Some(dir) = config.cwd.as_deref() {
            cmd.current_dir(dir);
        }

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
            name: name.clone(),
            reason: format!("{e}"),
        })?;

        let stdin = child.stdin.take().ok_or(McpError::SpawnFailed {
            name: name.clone(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or(McpError::SpawnFailed {
            name: name.clone(),
            reason: "failed to capture stdout".into(),
        })?;
        let stderr_handle = child.stderr.take();

        tracing::info!(
            server = %name,
            command = %config.command,
            pid = child.id(),
            "spawned tool server"
        );

        let transport = StdioTransport::new(&name, stdout, stdin);
        let mut session = Self::connecting(descriptor, transport, Some(child), options);

        match session.handshake_with_timeout().await {
            Ok(()) => {
                if let Some(stderr) = stderr_handle {
                    tokio::spawn(forward_stderr(name, stderr));
                }
                Ok(session)
            }
            Err(reason) => {
                session.close().await;
                let stderr_ctx = read_stderr_on_failure(stderr_handle).await;
                if !stderr_ctx.is_empty() {
                    tracing::warn!(
                        server = %name,
                        stderr = %stderr_ctx,
                        "server stderr captured on handshake failure"
                    );
                }
                Err(McpError::HandshakeFailed {
                    name,
                    reason: format!("{reason}{}", format_stderr_suffix(&stderr_ctx)),
                })
            }
        }
    }

    /// Perform the handshake over an already-connected byte channel.
    ///
    /// `reader` carries the server's output and `writer` its input. Used for
    /// in-process servers and anything not launched as a child process.
    pub async fn connect<R, W>(
        descriptor: ServerDescriptor,
        reader: R,
        writer: W,
        options: SessionOptions,
    ) -> Result<Self, McpError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let name = descriptor.name.clone();
        let transport = StdioTransport::new(&name, reader, writer);
        let mut session = Self::connecting(descriptor, transport, None, options);

        match session.handshake_with_timeout().await {
            Ok(()) => Ok(session),
            Err(reason) => {
                session.close().await;
                Err(McpError::HandshakeFailed { name, reason })
            }
        }
    }

    fn connecting(
        descriptor: ServerDescriptor,
        transport: StdioTransport,
        process: Option<Child>,
        options: SessionOptions,
    ) -> Self {
        Self {
            descriptor,
            transport,
            process: TokioMutex::new(process),
            state: Mutex::new(SessionState::Connecting),
            capabilities: ServerCapabilities::default(),
            tools: Vec::new(),
            options,
            consecutive_timeouts: AtomicU32::new(0),
            abandoned_requests: AtomicU64::new(0),
        }
    }

    // ─── Handshake ───────────────────────────────────────────────────────

    async fn handshake_with_timeout(&mut self) -> Result<(), String> {
        let timeout = self.options.handshake_timeout;
        match tokio::time::timeout(timeout, self.handshake()).await {
            Ok(result) => result,
            Err(_) => Err(format!(
                "initialization timed out after {}ms",
                timeout.as_millis()
            )),
        }
    }

    /// `initialize` → `notifications/initialized` → `tools/list`.
    async fn handshake(&mut self) -> Result<(), String> {
        let params = serde_json::json!({
            "protocolVersion": SUPPORTED_PROTOCOL_VERSIONS[0],
            "capabilities": {},
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
        });

        let response = self
            .transport
            .request("initialize", Some(params))
            .await
            .map_err(|e| e.to_string())?;
        let result = extract_result(response).map_err(|e| e.to_string())?;

        let init: InitializeResult = serde_json::from_value(result)
            .map_err(|e| format!("failed to parse initialize response: {e}"))?;

        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&init.protocol_version.as_str()) {
            return Err(format!(
                "unsupported protocol version '{}' (supported: {})",
                init.protocol_version,
                SUPPORTED_PROTOCOL_VERSIONS.join(", ")
            ));
        }

        self.transport
            .notify("notifications/initialized", None)
            .await
            .map_err(|e| e.to_string())?;

        let tools = match init.tools {
            Some(tools) => tools,
            None => self.fetch_tool_pages().await?,
        };

        if let Some(bad) = tools.iter().find(|t| t.name.trim().is_empty()) {
            return Err(format!("server advertised a tool with an empty name: {bad:?}"));
        }

        self.capabilities = ServerCapabilities {
            protocol_version: init.protocol_version,
            server_info: init.server_info.unwrap_or_default(),
            raw: init.capabilities,
        };
        self.tools = tools;
        self.set_state(SessionState::Ready);

        tracing::info!(
            server = %self.descriptor.name,
            protocol = %self.capabilities.protocol_version,
            tool_count = self.tools.len(),
            tools = ?self.tools.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
            "server session ready"
        );
        Ok(())
    }

    async fn fetch_tool_pages(&self) -> Result<Vec<McpToolDefinition>, String> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_TOOL_PAGES {
            let params = cursor
                .as_ref()
                .map(|c| serde_json::json!({ "cursor": c }));
            let response = self
                .transport
                .request("tools/list", params)
                .await
                .map_err(|e| e.to_string())?;
            let result = extract_result(response).map_err(|e| e.to_string())?;
            let page: ListToolsResult = serde_json::from_value(result)
                .map_err(|e| format!("failed to parse tools/list response: {e}"))?;

            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(tools),
            }
        }

        Err(format!("tools/list returned more than {MAX_TOOL_PAGES} pages"))
    }

    // ─── Accessors ───────────────────────────────────────────────────────

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &ServerDescriptor {
        &self.descriptor
    }

    pub fn capabilities(&self) -> &ServerCapabilities {
        &self.capabilities
    }

    /// The manifest obtained during the handshake. Never re-queries the server.
    pub fn list_tools(&self) -> &[McpToolDefinition] {
        &self.tools
    }

    /// Current lifecycle state.
    ///
    /// A channel the reader task has shut (EOF, read error, invalid frame)
    /// makes the session Closed even when no call was in flight.
    pub fn state(&self) -> SessionState {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *state != SessionState::Closed {
            if let Some(reason) = self.transport.close_reason() {
                tracing::warn!(
                    server = %self.descriptor.name,
                    from = ?*state,
                    reason = ?reason,
                    "server channel closed, session closed"
                );
                *state = SessionState::Closed;
            }
        }
        *state
    }

    pub fn abandoned_requests(&self) -> u64 {
        self.abandoned_requests.load(Ordering::Relaxed)
    }

    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts.load(Ordering::Relaxed)
    }

    /// Move to `next`, refusing any transition out of Closed.
    fn set_state(&self, next: SessionState) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *state == SessionState::Closed || *state == next {
            return;
        }
        tracing::debug!(
            server = %self.descriptor.name,
            from = ?*state,
            to = ?next,
            "session state change"
        );
        *state = next;
    }

    // ─── Tool Invocation ─────────────────────────────────────────────────

    /// Call a tool and return the raw `tools/call` result.
    ///
    /// Suspends until the matching response arrives, `timeout` elapses, or
    /// `cancel` fires. Other invocations on this session proceed in parallel.
    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, McpError> {
        if self.state() == SessionState::Closed {
            return Err(McpError::SessionClosed {
                name: self.descriptor.name.clone(),
                reason: "session is closed".into(),
            });
        }

        let id = self.transport.next_id();
        let params = serde_json::json!({
            "name": tool_name,
            "arguments": arguments,
        });

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = tokio::time::timeout(
                timeout,
                self.transport.request_with_id(id, "tools/call", Some(params)),
            ) => Some(result),
        };

        match outcome {
            Some(Ok(Ok(response))) => {
                self.consecutive_timeouts.store(0, Ordering::Relaxed);
                extract_result(response)
            }
            Some(Ok(Err(e))) => {
                if e.is_fatal_to_session() {
                    tracing::error!(
                        server = %self.descriptor.name,
                        error = %e,
                        "session channel failed, closing"
                    );
                    self.set_state(SessionState::Closed);
                }
                Err(e)
            }
            Some(Err(_)) => {
                self.abandoned_requests.fetch_add(1, Ordering::Relaxed);
                let streak = self.consecutive_timeouts.fetch_add(1, Ordering::Relaxed) + 1;
                if streak >= self.options.degraded_after_timeouts
                    && self.state() == SessionState::Ready
                {
                    tracing::warn!(
                        server = %self.descriptor.name,
                        consecutive_timeouts = streak,
                        "session degraded after repeated timeouts"
                    );
                    self.set_state(SessionState::Degraded);
                }
                self.send_cancelled(id, "request timed out").await;
                Err(McpError::Timeout {
                    method: "tools/call".into(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
            None => {
                // Counted as abandoned, but caller cancellation never degrades.
                self.abandoned_requests.fetch_add(1, Ordering::Relaxed);
                self.send_cancelled(id, "cancelled by caller").await;
                Err(McpError::Cancelled {
                    method: "tools/call".into(),
                })
            }
        }
    }

    /// Call a tool and fold every outcome into a `ToolCallResult`.
    ///
    /// `tool_name` is the server's own (raw) tool name; the result is
    /// labelled with it and carries `call_id` for correlation.
    pub async fn invoke(
        &self,
        call_id: &str,
        tool_name: &str,
        arguments: serde_json::Value,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> ToolCallResult {
        let start = Instant::now();
        let outcome = self.call_tool(tool_name, arguments, timeout, cancel).await;
        let elapsed = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(value) => match serde_json::from_value::<CallToolResult>(value.clone()) {
                Ok(parsed) if parsed.is_error => {
                    let text = parsed.text();
                    let detail = if text.is_empty() {
                        "tool reported an error without details".to_string()
                    } else {
                        text
                    };
                    ToolCallResult::failure(call_id, tool_name, ToolErrorKind::ToolError, detail, elapsed)
                }
                _ => ToolCallResult::success(call_id, tool_name, value, elapsed),
            },
            Err(McpError::ServerError { code, message, .. }) => ToolCallResult::failure(
                call_id,
                tool_name,
                ToolErrorKind::ServerError,
                format!("[{code}] {message}"),
                elapsed,
            ),
            Err(e) => {
                ToolCallResult::failure(call_id, tool_name, e.tool_error_kind(), e.to_string(), elapsed)
            }
        }
    }

    async fn send_cancelled(&self, request_id: u64, reason: &str) {
        let params = serde_json::json!({ "requestId": request_id, "reason": reason });
        let _ = tokio::time::timeout(
            CANCEL_NOTIFY_TIMEOUT,
            self.transport.notify("notifications/cancelled", Some(params)),
        )
        .await;
    }

    // ─── Liveness ────────────────────────────────────────────────────────

    /// Round-trip a `ping` request.
    pub async fn ping(&self, timeout: Duration) -> Result<(), McpError> {
        let response = tokio::time::timeout(timeout, self.transport.request("ping", None))
            .await
            .map_err(|_| McpError::Timeout {
                method: "ping".into(),
                timeout_ms: timeout.as_millis() as u64,
            })??;
        extract_result(response).map(|_| ())
    }

    /// Check whether the channel (and process, if any) is still up.
    pub async fn is_alive(&self) -> bool {
        if self.transport.is_closed() {
            return false;
        }
        let mut process = self.process.lock().await;
        match process.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => true,
        }
    }

    /// Why the channel closed, if it has.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.transport.close_reason()
    }

    /// Best-effort graceful shutdown. Always safe to call, idempotent.
    pub async fn close(&self) {
        self.set_state(SessionState::Closed);
        self.transport.close().await;

        let child = self.process.lock().await.take();
        if let Some(mut child) = child {
            // Closing stdin asks a stdio server to exit; give it a moment.
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!(server = %self.descriptor.name, %status, "server exited");
                }
                _ => {
                    let _ = child.kill().await;
                    tracing::debug!(server = %self.descriptor.name, "server killed after shutdown timeout");
                }
            }
        }
    }
}

// ─── Stderr Capture ──────────────────────────────────────────────────────────

/// Forward a healthy server's stderr into the log so the pipe never fills.
async fn forward_stderr(server: String, stderr: ChildStderr) {
    use tokio::io::{AsyncBufReadExt, BufReader};

    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(server = %server, "stderr: {line}");
    }
}

/// Read any available stderr output from a failed server process.
///
/// Uses a short timeout to avoid blocking if stderr is empty or the process
/// is still writing. Truncates to 2000 chars to keep log messages readable.
async fn read_stderr_on_failure(stderr_handle: Option<ChildStderr>) -> String {
    use tokio::io::AsyncReadExt;

    let Some(mut stderr) = stderr_handle else {
        return String::new();
    };

    let mut buf = String::new();
    match tokio::time::timeout(Duration::from_millis(500), stderr.read_to_string(&mut buf)).await {
        Ok(Ok(_)) => {
            if buf.len() > 2000 {
                let mut cut = 2000;
                while !buf.is_char_boundary(cut) {
                    cut -= 1;
                }
                buf.truncate(cut);
                buf.push_str("...(truncated)");
            }
            buf
        }
        _ => String::new(),
    }
}

/// Format a stderr suffix for error messages (empty string if no stderr).
fn format_stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(" | stderr: {}", stderr.trim())
    }
}

// ─── Connectors ──────────────────────────────────────────────────────────────

/// Opens sessions for descriptors. The client uses it for startup and for
/// replacing Degraded sessions.
#[async_trait]
pub trait ServerConnector: Send + Sync {
    async fn connect(
        &self,
        descriptor: &ServerDescriptor,
        options: &SessionOptions,
    ) -> Result<ServerSession, McpError>;
}

/// Launches each server as a child process speaking MCP over stdio.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdioConnector;

#[async_trait]
impl ServerConnector for StdioConnector {
    async fn connect(
        &self,
        descriptor: &ServerDescriptor,
        options: &SessionOptions,
    ) -> Result<ServerSession, McpError> {
        ServerSession::open(descriptor.clone(), options.clone()).await
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
