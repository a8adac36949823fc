//! MCP Client error types.

use thiserror::Error;

use super::types::ToolErrorKind;

/// Errors that can occur during MCP client operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// A server process failed to start or could not be reached.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed {
        name: String,
        reason: String,
    },

    /// The capability-discovery handshake failed or was incompatible.
    #[error("server '{name}' handshake failed: {reason}")]
    HandshakeFailed {
        name: String,
        reason: String,
    },

    /// I/O error on the server channel (write failed, stdout closed).
    #[error("transport error for server '{server}': {reason}")]
    TransportError {
        server: String,
        reason: String,
    },

    /// The server sent a frame that is not valid JSON-RPC 2.0.
    #[error("protocol violation from server '{server}': {reason}")]
    ProtocolViolation {
        server: String,
        reason: String,
    },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// Tool not found in the aggregated registry.
    #[error("unknown tool: '{name}'")]
    UnknownTool {
        name: String,
    },

    /// Tool call arguments failed schema validation.
    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments {
        tool: String,
        reason: String,
    },

    /// A request timed out.
    #[error("request '{method}' timed out after {timeout_ms}ms")]
    Timeout {
        method: String,
        timeout_ms: u64,
    },

    /// The caller cancelled the request before a response arrived.
    #[error("request '{method}' cancelled")]
    Cancelled {
        method: String,
    },

    /// The session is closed (or was dropped) and accepts no requests.
    #[error("server '{name}' is not available: {reason}")]
    SessionClosed {
        name: String,
        reason: String,
    },

    /// Configuration error (missing servers, bad config file).
    #[error("config error: {reason}")]
    ConfigError {
        reason: String,
    },
}

impl McpError {
    /// Classify this error as a tool-result failure kind.
    ///
    /// Used when an error has to be handed to the model as data instead of
    /// being propagated.
    pub fn tool_error_kind(&self) -> ToolErrorKind {
        match self {
            McpError::UnknownTool { .. } => ToolErrorKind::UnknownTool,
            McpError::InvalidArguments { .. } => ToolErrorKind::InvalidArguments,
            McpError::Timeout { .. } => ToolErrorKind::Timeout,
            McpError::Cancelled { .. } => ToolErrorKind::Cancelled,
            McpError::ServerError { .. } => ToolErrorKind::ServerError,
            McpError::SpawnFailed { .. }
            | McpError::HandshakeFailed { .. }
            | McpError::TransportError { .. }
            | McpError::ProtocolViolation { .. }
            | McpError::SessionClosed { .. }
            | McpError::ConfigError { .. } => ToolErrorKind::SessionUnavailable,
        }
    }

    /// Whether this error means the channel to the server is unusable.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(
            self,
            McpError::TransportError { .. }
                | McpError::ProtocolViolation { .. }
                | McpError::SessionClosed { .. }
        )
    }
}
