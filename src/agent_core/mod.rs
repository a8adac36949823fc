//! Agent Core: orchestration layer for mcp-host.
//!
//! Submodules:
//! - `conversation`: The ordered transcript replayed to the model
//! - `tool_router`: Dispatches model tool calls to MCP servers
//! - `orchestrator`: The agent loop (AwaitingModel → Invoking → Answering)
//! - `types`: Loop states, answers and failures
//! - `errors`: Agent-level error types

pub mod conversation;
pub mod errors;
pub mod orchestrator;
pub mod tool_router;
pub mod types;

// Re-exports for convenience
pub use conversation::{tool_call_trace, Transcript};
pub use errors::AgentError;
pub use orchestrator::Orchestrator;
pub use tool_router::ToolRouter;
pub use types::{Answer, Failure, FailureKind, LoopState};
