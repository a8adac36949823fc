//! MCP Client: JSON-RPC over stdio transport for MCP server management.
//!
//! This module handles:
//! - Spawning MCP server child processes and handshaking with them
//! - Multiplexed JSON-RPC 2.0 communication over process stdio
//! - Merging every server's tools into one collision-free namespace
//! - Tool call routing, validation, and execution
//! - Session recovery (degraded servers are reconnected once, dead ones dropped)
//!
//! The orchestrator owns one `McpClient` and dispatches the model's tool
//! calls through registry snapshots taken from it.

pub mod client;
pub mod errors;
pub mod registry;
pub mod session;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use client::McpClient;
pub use errors::McpError;
pub use registry::{ToolEntry, ToolRegistry, ToolRename};
pub use session::{ServerConnector, ServerSession, SessionOptions, SessionState, StdioConnector};
pub use types::{McpToolDefinition, ServerConfig, ServerDescriptor, ToolCallResult, ToolErrorKind};
