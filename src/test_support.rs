//! In-process fakes shared by the unit tests: a scriptable MCP server that
//! speaks newline-delimited JSON-RPC over a duplex pipe, a connector that
//! hands those servers to the client, and a scripted model gateway.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, WriteHalf};
use tokio::sync::Mutex as TokioMutex;

use crate::inference::errors::InferenceError;
use crate::inference::gateway::Gateway;
use crate::inference::types::{ChatMessage, ModelTurn, ToolCall, ToolDefinition};
use crate::mcp_client::errors::McpError;
use crate::mcp_client::session::{ServerConnector, ServerSession, SessionOptions};
use crate::mcp_client::types::{ServerConfig, ServerDescriptor};

// ─── Mock MCP Server ─────────────────────────────────────────────────────────

/// How the mock answers a `tools/call` for one tool.
#[derive(Debug, Clone)]
pub(crate) enum MockBehavior {
    /// Reply with a text content block after an optional delay.
    Reply { text: String, delay: Duration },
    /// Reply with `isError: true`.
    ToolError(String),
    /// Reply with a JSON-RPC error object.
    RpcError { code: i32, message: String },
    /// Never reply.
    Hang,
    /// Reply with a frame that is not JSON-RPC 2.0.
    InvalidFrame,
}

impl MockBehavior {
    pub(crate) fn reply(text: &str) -> Self {
        MockBehavior::Reply {
            text: text.to_string(),
            delay: Duration::ZERO,
        }
    }

    pub(crate) fn delayed(delay: Duration, text: &str) -> Self {
        MockBehavior::Reply {
            text: text.to_string(),
            delay,
        }
    }

    pub(crate) fn tool_error(text: &str) -> Self {
        MockBehavior::ToolError(text.to_string())
    }

    pub(crate) fn rpc_error(code: i32, message: &str) -> Self {
        MockBehavior::RpcError {
            code,
            message: message.to_string(),
        }
    }
}

/// What the mock saw, shared across every connection made from one template.
#[derive(Debug, Clone, Default)]
pub(crate) struct MockHandle {
    log: Arc<Mutex<MockLog>>,
}

#[derive(Debug, Default)]
struct MockLog {
    methods: Vec<String>,
    calls: Vec<(String, Value)>,
    cancellations: Vec<u64>,
    connections: usize,
}

impl MockHandle {
    fn with<T>(&self, f: impl FnOnce(&mut MockLog) -> T) -> T {
        let mut log = self.log.lock().unwrap();
        f(&mut log)
    }

    /// `(tool name, arguments)` for every `tools/call` received, in order.
    pub(crate) fn calls(&self) -> Vec<(String, Value)> {
        self.with(|l| l.calls.clone())
    }

    pub(crate) fn call_count(&self) -> usize {
        self.with(|l| l.calls.len())
    }

    pub(crate) fn method_count(&self, method: &str) -> usize {
        self.with(|l| l.methods.iter().filter(|m| *m == method).count())
    }

    /// Request ids named by `notifications/cancelled`.
    pub(crate) fn cancellations(&self) -> Vec<u64> {
        self.with(|l| l.cancellations.clone())
    }

    pub(crate) fn connections(&self) -> usize {
        self.with(|l| l.connections)
    }
}

/// A scriptable MCP server template.
#[derive(Debug, Clone)]
pub(crate) struct MockServer {
    name: String,
    tools: Vec<(String, MockBehavior)>,
    protocol_version: String,
    inline_tools: bool,
    malformed_initialize: bool,
    page_size: Option<usize>,
    options: SessionOptions,
    handle: MockHandle,
}

impl MockServer {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            tools: Vec::new(),
            protocol_version: "2025-06-18".into(),
            inline_tools: false,
            malformed_initialize: false,
            page_size: None,
            options: SessionOptions {
                handshake_timeout: Duration::from_secs(2),
                degraded_after_timeouts: 3,
            },
            handle: MockHandle::default(),
        }
    }

    pub(crate) fn tool(mut self, name: &str, behavior: MockBehavior) -> Self {
        self.tools.push((name.to_string(), behavior));
        self
    }

    pub(crate) fn protocol_version(mut self, version: &str) -> Self {
        self.protocol_version = version.to_string();
        self
    }

    pub(crate) fn inline_tools(mut self) -> Self {
        self.inline_tools = true;
        self
    }

    pub(crate) fn malformed_initialize(mut self) -> Self {
        self.malformed_initialize = true;
        self
    }

    pub(crate) fn page_size(mut self, size: usize) -> Self {
        self.page_size = Some(size);
        self
    }

    pub(crate) fn degraded_after(mut self, timeouts: u32) -> Self {
        self.options.degraded_after_timeouts = timeouts;
        self
    }

    pub(crate) fn handle(&self) -> MockHandle {
        self.handle.clone()
    }

    pub(crate) fn descriptor(&self) -> ServerDescriptor {
        ServerDescriptor::new(
            &self.name,
            ServerConfig {
                command: format!("mock-{}", self.name),
                args: vec![],
                env: HashMap::new(),
                cwd: None,
            },
        )
    }

    /// Start the server task and handshake a session against it.
    pub(crate) async fn connect(self) -> Result<(ServerSession, MockHandle), McpError> {
        let options = self.options.clone();
        let handle = self.handle();
        let session = self.connect_with(&options).await?;
        Ok((session, handle))
    }

    async fn connect_with(&self, options: &SessionOptions) -> Result<ServerSession, McpError> {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client_io);
        self.handle.with(|l| l.connections += 1);
        tokio::spawn(self.clone().serve(server_io));
        ServerSession::connect(self.descriptor(), client_read, client_write, options.clone()).await
    }

    fn definitions(&self) -> Vec<Value> {
        self.tools
            .iter()
            .map(|(name, _)| {
                json!({
                    "name": name,
                    "description": format!("{name} on {}", self.name),
                    "inputSchema": {"type": "object", "properties": {}},
                })
            })
            .collect()
    }

    async fn serve(self, io: tokio::io::DuplexStream) {
        let (read, write) = tokio::io::split(io);
        let writer = Arc::new(TokioMutex::new(write));
        let mut lines = BufReader::new(read).lines();

        while let Ok(Some(line)) = lines.next_line().await {
            let Ok(msg) = serde_json::from_str::<Value>(&line) else {
                continue;
            };
            let method = msg["method"].as_str().unwrap_or_default().to_string();
            let id = msg.get("id").cloned().unwrap_or(Value::Null);
            self.handle.with(|l| l.methods.push(method.clone()));

            match method.as_str() {
                "initialize" => {
                    let result = if self.malformed_initialize {
                        json!({"unexpected": true})
                    } else {
                        let mut result = json!({
                            "protocolVersion": self.protocol_version,
                            "capabilities": {"tools": {}},
                            "serverInfo": {"name": self.name, "version": "0.0.1"},
                        });
                        if self.inline_tools {
                            result["tools"] = Value::Array(self.definitions());
                        }
                        result
                    };
                    respond(&writer, json!({"jsonrpc": "2.0", "id": id, "result": result})).await;
                }
                "tools/list" => {
                    let all = self.definitions();
                    let start: usize = msg["params"]["cursor"]
                        .as_str()
                        .and_then(|c| c.parse().ok())
                        .unwrap_or(0);
                    let size = self.page_size.unwrap_or(all.len().max(1));
                    let end = (start + size).min(all.len());
                    let mut result = json!({"tools": all[start..end].to_vec()});
                    if end < all.len() {
                        result["nextCursor"] = json!(end.to_string());
                    }
                    respond(&writer, json!({"jsonrpc": "2.0", "id": id, "result": result})).await;
                }
                "tools/call" => {
                    let tool = msg["params"]["name"].as_str().unwrap_or_default().to_string();
                    let args = msg["params"]["arguments"].clone();
                    self.handle.with(|l| l.calls.push((tool.clone(), args)));
                    let behavior = self
                        .tools
                        .iter()
                        .find(|(name, _)| *name == tool)
                        .map(|(_, b)| b.clone());
                    let writer = Arc::clone(&writer);
                    tokio::spawn(async move {
                        let frame = match behavior {
                            Some(MockBehavior::Reply { text, delay }) => {
                                tokio::time::sleep(delay).await;
                                json!({"jsonrpc": "2.0", "id": id, "result": {
                                    "content": [{"type": "text", "text": text}],
                                    "isError": false,
                                }})
                            }
                            Some(MockBehavior::ToolError(text)) => {
                                json!({"jsonrpc": "2.0", "id": id, "result": {
                                    "content": [{"type": "text", "text": text}],
                                    "isError": true,
                                }})
                            }
                            Some(MockBehavior::RpcError { code, message }) => {
                                json!({"jsonrpc": "2.0", "id": id, "error": {
                                    "code": code, "message": message,
                                }})
                            }
                            Some(MockBehavior::InvalidFrame) => {
                                json!({"jsonrpc": "1.0", "id": id, "result": {}})
                            }
                            Some(MockBehavior::Hang) => return,
                            None => json!({"jsonrpc": "2.0", "id": id, "error": {
                                "code": -32602, "message": format!("unknown tool {tool}"),
                            }}),
                        };
                        respond(&writer, frame).await;
                    });
                }
                "ping" => {
                    respond(&writer, json!({"jsonrpc": "2.0", "id": id, "result": {}})).await;
                }
                "notifications/cancelled" => {
                    if let Some(request_id) = msg["params"]["requestId"].as_u64() {
                        self.handle.with(|l| l.cancellations.push(request_id));
                    }
                }
                _ => {}
            }
        }
    }
}

async fn respond(writer: &TokioMutex<WriteHalf<tokio::io::DuplexStream>>, frame: Value) {
    let mut line = frame.to_string();
    line.push('\n');
    let mut w = writer.lock().await;
    let _ = w.write_all(line.as_bytes()).await;
    let _ = w.flush().await;
}

// ─── Departing Peer ──────────────────────────────────────────────────────────

/// Handshake against a bare peer that advertises one inline `search` tool.
///
/// Once the returned sender fires (or is dropped) the peer writes `parting`,
/// if any, and hangs up without waiting for a request.
pub(crate) async fn departing_peer(
    name: &str,
    parting: Option<&'static str>,
) -> (ServerSession, tokio::sync::oneshot::Sender<()>) {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let (client_read, client_write) = tokio::io::split(client_io);
    let (leave_tx, leave_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        let (read, mut write) = tokio::io::split(server_io);
        let mut lines = BufReader::new(read).lines();

        let line = lines.next_line().await.unwrap().unwrap();
        let request: Value = serde_json::from_str(&line).unwrap();
        let reply = json!({"jsonrpc": "2.0", "id": request["id"], "result": {
            "protocolVersion": "2025-06-18",
            "capabilities": {"tools": {}},
            "tools": [{"name": "search", "inputSchema": {"type": "object"}}],
        }});
        write.write_all(format!("{reply}\n").as_bytes()).await.unwrap();
        // notifications/initialized
        let _ = lines.next_line().await;

        let _ = leave_rx.await;
        if let Some(frame) = parting {
            let _ = write.write_all(format!("{frame}\n").as_bytes()).await;
            let _ = write.flush().await;
        }
    });

    let descriptor = MockServer::new(name).descriptor();
    let options = SessionOptions {
        handshake_timeout: Duration::from_secs(2),
        degraded_after_timeouts: 3,
    };
    let session = ServerSession::connect(descriptor, client_read, client_write, options)
        .await
        .unwrap();
    (session, leave_tx)
}

/// Wait for the reader task to notice the channel went away.
pub(crate) async fn wait_for_close(session: &ServerSession) {
    for _ in 0..100 {
        if session.close_reason().is_some() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("channel for '{}' never closed", session.name());
}

/// Connector that serves registered mock templates by server name.
#[derive(Debug, Clone, Default)]
pub(crate) struct MockConnector {
    servers: Arc<Mutex<HashMap<String, MockServer>>>,
}

impl MockConnector {
    pub(crate) fn register(&self, server: MockServer) -> MockHandle {
        let handle = server.handle();
        self.servers.lock().unwrap().insert(server.name.clone(), server);
        handle
    }

    /// Replace the template used for later connects to `name`.
    pub(crate) fn replace(&self, server: MockServer) {
        self.servers.lock().unwrap().insert(server.name.clone(), server);
    }

    pub(crate) fn remove(&self, name: &str) {
        self.servers.lock().unwrap().remove(name);
    }
}

#[async_trait]
impl ServerConnector for MockConnector {
    async fn connect(
        &self,
        descriptor: &ServerDescriptor,
        options: &SessionOptions,
    ) -> Result<ServerSession, McpError> {
        let template = self.servers.lock().unwrap().get(&descriptor.name).cloned();
        match template {
            Some(server) => server.connect_with(options).await,
            None => Err(McpError::SpawnFailed {
                name: descriptor.name.clone(),
                reason: "no such mock server".into(),
            }),
        }
    }
}

// ─── Scripted Gateway ────────────────────────────────────────────────────────

/// A gateway that replays a fixed script of replies and records what it saw.
#[derive(Default)]
pub(crate) struct ScriptedGateway {
    script: Mutex<VecDeque<Result<ModelTurn, InferenceError>>>,
    /// Fallback once the script runs out; `None` fails the test loudly.
    repeat: Option<ModelTurn>,
    seen: Mutex<Vec<(Vec<ChatMessage>, Vec<ToolDefinition>)>>,
}

impl ScriptedGateway {
    pub(crate) fn new(script: Vec<Result<ModelTurn, InferenceError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            repeat: None,
            seen: Mutex::new(Vec::new()),
        }
    }

    /// A gateway that answers every turn with `turn`.
    pub(crate) fn repeating(turn: ModelTurn) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            repeat: Some(turn),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn call_count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    /// The transcript and manifest of the `n`th request.
    pub(crate) fn request(&self, n: usize) -> (Vec<ChatMessage>, Vec<ToolDefinition>) {
        self.seen.lock().unwrap()[n].clone()
    }
}

#[async_trait]
impl Gateway for ScriptedGateway {
    async fn converse(
        &self,
        transcript: &[ChatMessage],
        manifest: &[ToolDefinition],
    ) -> Result<ModelTurn, InferenceError> {
        self.seen
            .lock()
            .unwrap()
            .push((transcript.to_vec(), manifest.to_vec()));
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(reply) => reply,
            None => match &self.repeat {
                Some(turn) => Ok(turn.clone()),
                None => panic!("scripted gateway ran out of replies"),
            },
        }
    }
}

/// Shorthand for a tool-request turn with no accompanying text.
pub(crate) fn tool_turn(calls: &[(&str, &str, Value)]) -> ModelTurn {
    ModelTurn::ToolRequests {
        text: None,
        calls: calls
            .iter()
            .map(|(id, name, args)| ToolCall {
                id: id.to_string(),
                name: name.to_string(),
                arguments: args.clone(),
            })
            .collect(),
    }
}
