//! Inference: the capability gateway between the orchestrator and a model.
//!
//! This module handles all communication with the model endpoint:
//! - The `Gateway` trait the orchestrator depends on
//! - `InferenceClient`, its HTTP implementation
//! - OpenAI Chat Completions and Anthropic Messages wire formats
//! - Error classification (retryable, fatal for the turn, fatal for the session)
//!
//! The wire format is chosen by config, making the model interchangeable
//! without code changes.

pub mod anthropic;
pub mod client;
pub mod config;
pub mod errors;
pub mod gateway;
pub mod openai;
pub mod types;

// Re-exports for convenience
pub use client::InferenceClient;
pub use config::{ApiFormat, ModelConfig};
pub use errors::InferenceError;
pub use gateway::Gateway;
pub use types::{ChatMessage, ModelTurn, Role, ToolCall, ToolDefinition};
