//! Shared types for the MCP client.
//!
//! JSON-RPC 2.0 message types, MCP protocol structures, server descriptors,
//! and the tool invocation result handed back to the orchestration loop.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 notification (a request without an id).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response message (success or error).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

// ─── MCP Protocol Types ──────────────────────────────────────────────────────

/// Protocol revisions this client can speak, newest first.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-06-18", "2025-03-26", "2024-11-05"];

/// MCP tool definition as returned by `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "inputSchema")]
    pub input_schema: serde_json::Value,
}

/// MCP `initialize` response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    #[serde(alias = "protocolVersion")]
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: serde_json::Value,
    #[serde(default, alias = "serverInfo")]
    pub server_info: Option<ServerInfo>,
    /// Some servers advertise their tools inline; when present, `tools/list`
    /// is skipped.
    #[serde(default)]
    pub tools: Option<Vec<McpToolDefinition>>,
}

/// Server info returned in the initialize response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

/// MCP `tools/list` response payload (one page).
#[derive(Debug, Clone, Deserialize)]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<McpToolDefinition>,
    #[serde(default, alias = "nextCursor")]
    pub next_cursor: Option<String>,
}

/// MCP `tools/call` response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<serde_json::Value>,
    #[serde(default, alias = "isError")]
    pub is_error: bool,
}

impl CallToolResult {
    /// Concatenate the `text` blocks of the result content.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| block.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// ─── Server Descriptors ──────────────────────────────────────────────────────

/// How to launch one tool server (an entry of the `servers` config map).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory for the server process.
    #[serde(default)]
    pub cwd: Option<String>,
}

/// Identity plus launch parameters of a tool server. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerDescriptor {
    pub name: String,
    pub config: ServerConfig,
}

impl ServerDescriptor {
    pub fn new(name: &str, config: ServerConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
        }
    }
}

/// What the server declared during the handshake.
#[derive(Debug, Clone, Default)]
pub struct ServerCapabilities {
    pub protocol_version: String,
    pub server_info: ServerInfo,
    pub raw: serde_json::Value,
}

// ─── Tool Invocation Results ─────────────────────────────────────────────────

/// Why a tool invocation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    /// No registered tool has the requested name.
    UnknownTool,
    /// Arguments did not satisfy the tool's input schema.
    InvalidArguments,
    /// No response before the per-call timeout.
    Timeout,
    /// The caller cancelled the query while the call was in flight.
    Cancelled,
    /// The server answered with a JSON-RPC error.
    ServerError,
    /// The tool ran and reported failure (`isError: true`).
    ToolError,
    /// The owning session is closed or unreachable.
    SessionUnavailable,
}

impl ToolErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolErrorKind::UnknownTool => "unknown_tool",
            ToolErrorKind::InvalidArguments => "invalid_arguments",
            ToolErrorKind::Timeout => "timeout",
            ToolErrorKind::Cancelled => "cancelled",
            ToolErrorKind::ServerError => "server_error",
            ToolErrorKind::ToolError => "tool_error",
            ToolErrorKind::SessionUnavailable => "session_unavailable",
        }
    }
}

/// Result of a tool call execution, correlated to the model's request id.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCallResult {
    /// The correlation id of the request this result satisfies.
    pub call_id: String,
    /// The presented tool name the model used.
    pub tool_name: String,
    pub success: bool,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub error_kind: Option<ToolErrorKind>,
    pub execution_time_ms: u64,
}

impl ToolCallResult {
    pub fn success(
        call_id: &str,
        tool_name: &str,
        result: serde_json::Value,
        execution_time_ms: u64,
    ) -> Self {
        Self {
            call_id: call_id.to_string(),
            tool_name: tool_name.to_string(),
            success: true,
            result: Some(result),
            error: None,
            error_kind: None,
            execution_time_ms,
        }
    }

    pub fn failure(
        call_id: &str,
        tool_name: &str,
        kind: ToolErrorKind,
        detail: impl Into<String>,
        execution_time_ms: u64,
    ) -> Self {
        Self {
            call_id: call_id.to_string(),
            tool_name: tool_name.to_string(),
            success: false,
            result: None,
            error: Some(detail.into()),
            error_kind: Some(kind),
            execution_time_ms,
        }
    }

    /// Text handed back to the model for this result.
    ///
    /// Successful MCP results are flattened to their text content blocks;
    /// failures carry the error kind so the model can tell a timeout from a
    /// tool that ran and refused.
    pub fn model_text(&self) -> String {
        if self.success {
            return extract_mcp_result_text(self.result.as_ref());
        }
        let kind = self
            .error_kind
            .map(|k| k.as_str())
            .unwrap_or("tool_error");
        let detail = self.error.as_deref().unwrap_or("unknown error");
        format!("Error [{kind}]: {detail}")
    }
}

/// Extract human-readable text from an MCP `tools/call` result.
///
/// MCP results follow `{ "content": [{ "type": "text", "text": "..." }] }`.
/// Non-text blocks are dropped; a result with no text at all is rendered as
/// pretty JSON.
pub fn extract_mcp_result_text(result: Option<&serde_json::Value>) -> String {
    let Some(value) = result else {
        return "No result returned.".to_string();
    };

    if let Some(content_arr) = value.get("content").and_then(|c| c.as_array()) {
        let texts: Vec<&str> = content_arr
            .iter()
            .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
            .collect();
        if !texts.is_empty() {
            return texts.join("\n");
        }
    }

    match serde_json::to_string_pretty(value) {
        Ok(s) => s,
        Err(_) => format!("{value:?}"),
    }
}

// ─── Standard MCP Error Codes ────────────────────────────────────────────────

/// Well-known JSON-RPC / MCP error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i32 = -32700;
    /// The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i32 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
}

// ─── Tests ───────────────────────────────────────────────────────────────────
