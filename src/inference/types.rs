//! Shared types for the inference client.
//!
//! These are wire-format neutral. The OpenAI and Anthropic adapters convert
//! them to and from their own request and response shapes.

use serde::{Deserialize, Serialize};

// ─── Transcript Messages ─────────────────────────────────────────────────────

/// Message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

/// A single message in the conversation transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    /// Text content. For assistant messages with tool calls this is the
    /// optional preamble the model produced alongside them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Assistant messages may contain tool calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Tool results carry the id of the call they answer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Presented name of the tool that produced a tool result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// Whether a tool result reports a failure.
    #[serde(default)]
    pub is_error: bool,
    /// RFC 3339 time the message was appended.
    pub timestamp: String,
}

impl ChatMessage {
    fn base(role: Role) -> Self {
        Self {
            role,
            content: None,
            tool_calls: None,
            tool_call_id: None,
            tool_name: None,
            is_error: false,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            content: Some(text.into()),
            ..Self::base(Role::User)
        }
    }

    /// A final (tool-free) assistant reply.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            content: Some(text.into()),
            ..Self::base(Role::Assistant)
        }
    }

    /// An assistant turn requesting tool calls.
    pub fn assistant_tool_calls(text: Option<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            content: text,
            tool_calls: Some(calls),
            ..Self::base(Role::Assistant)
        }
    }

    pub fn tool_result(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self {
            content: Some(content.into()),
            tool_call_id: Some(call_id.into()),
            tool_name: Some(tool_name.into()),
            is_error,
            ..Self::base(Role::Tool)
        }
    }

    /// Tool calls carried by this message (empty for non-assistant messages).
    pub fn calls(&self) -> &[ToolCall] {
        self.tool_calls.as_deref().unwrap_or_default()
    }
}

// ─── Tools ───────────────────────────────────────────────────────────────────

/// A tool offered to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the arguments object.
    pub input_schema: serde_json::Value,
}

impl ToolDefinition {
    /// The input schema, or an empty object schema when the server gave none.
    ///
    /// Both model APIs reject a tool whose schema is not an object schema.
    pub fn schema_or_empty(&self) -> serde_json::Value {
        if self.input_schema.is_object() {
            self.input_schema.clone()
        } else {
            serde_json::json!({"type": "object", "properties": {}})
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Correlation id, unique within one model reply.
    pub id: String,
    /// Presented tool name.
    pub name: String,
    /// Parsed JSON arguments.
    pub arguments: serde_json::Value,
}

// ─── Model Replies ───────────────────────────────────────────────────────────

/// What the model decided to do this turn.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelTurn {
    /// A final answer for the user.
    FinalAnswer(String),
    /// One or more tool invocations, optionally with some text.
    ToolRequests {
        text: Option<String>,
        calls: Vec<ToolCall>,
    },
}
