//! Transcript: the ordered conversation the model is replayed on every turn.
//!
//! Responsibilities:
//! - Append user, assistant, tool-call and tool-result messages
//! - Keep every tool-call message answered by exactly one result per call,
//!   in the order the model requested them
//! - Clip oversized tool output before it reaches the model

use crate::inference::types::{ChatMessage, Role, ToolCall};
use crate::mcp_client::types::ToolCallResult;

use super::errors::AgentError;

/// Conversation transcript for one orchestrator.
///
/// Append-only. The only way to add tool results is `push_tool_results`,
/// which checks them against the outstanding tool-call message.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    messages: Vec<ChatMessage>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    /// Ids of tool calls still waiting for results, in request order.
    pub fn pending_call_ids(&self) -> Vec<&str> {
        match self.messages.last() {
            Some(m) if m.role == Role::Assistant => {
                m.calls().iter().map(|c| c.id.as_str()).collect()
            }
            _ => Vec::new(),
        }
    }

    pub fn push_user(&mut self, text: impl Into<String>) -> Result<(), AgentError> {
        self.ensure_no_pending("user message")?;
        self.messages.push(ChatMessage::user(text));
        Ok(())
    }

    /// Append the model's final answer.
    pub fn push_assistant(&mut self, text: impl Into<String>) -> Result<(), AgentError> {
        self.ensure_no_pending("assistant answer")?;
        self.messages.push(ChatMessage::assistant(text));
        Ok(())
    }

    /// Append the model's tool-call message.
    pub fn push_tool_calls(
        &mut self,
        text: Option<String>,
        calls: Vec<ToolCall>,
    ) -> Result<(), AgentError> {
        if calls.is_empty() {
            return Err(AgentError::TranscriptOrder {
                reason: "a tool-call message needs at least one call".into(),
            });
        }
        self.ensure_no_pending("tool-call message")?;
        self.messages
            .push(ChatMessage::assistant_tool_calls(text, calls));
        Ok(())
    }

    /// Answer the outstanding tool calls.
    ///
    /// `results` must carry the same correlation ids as the outstanding
    /// calls, in the same order. Nothing is appended on mismatch.
    pub fn push_tool_results(
        &mut self,
        results: &[ToolCallResult],
        max_chars: usize,
    ) -> Result<(), AgentError> {
        let expected: Vec<String> = self
            .pending_call_ids()
            .into_iter()
            .map(str::to_string)
            .collect();
        if expected.is_empty() {
            return Err(AgentError::TranscriptOrder {
                reason: "no tool calls are waiting for results".into(),
            });
        }

        let got: Vec<String> = results.iter().map(|r| r.call_id.clone()).collect();
        if expected != got {
            return Err(AgentError::ResultMismatch { expected, got });
        }

        for result in results {
            let text = result.model_text();
            let content = truncate_tool_text(&text, max_chars);
            self.messages.push(ChatMessage::tool_result(
                &result.call_id,
                &result.tool_name,
                content,
                !result.success,
            ));
        }
        Ok(())
    }

    /// A copy of the messages, for `Failure` diagnostics.
    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.messages.clone()
    }

    fn ensure_no_pending(&self, what: &str) -> Result<(), AgentError> {
        let pending = self.pending_call_ids();
        if pending.is_empty() {
            return Ok(());
        }
        Err(AgentError::TranscriptOrder {
            reason: format!(
                "cannot append {what} while tool calls [{}] are unanswered",
                pending.join(", ")
            ),
        })
    }
}

/// One `[Calling tool NAME with args ARGS]` line per tool call in `messages`.
pub fn tool_call_trace(messages: &[ChatMessage]) -> Vec<String> {
    messages
        .iter()
        .flat_map(|m| m.calls())
        .map(|call| format!("[Calling tool {} with args {}]", call.name, call.arguments))
        .collect()
}

// ─── Truncation ──────────────────────────────────────────────────────────────

/// Truncate a string to at most `max_bytes` bytes on a valid UTF-8 char boundary.
pub(crate) fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Clip tool output to `max_chars` bytes, noting the original size.
///
/// `max_chars == 0` disables clipping.
pub(crate) fn truncate_tool_text(text: &str, max_chars: usize) -> String {
    if max_chars == 0 || text.len() <= max_chars {
        return text.to_string();
    }
    format!(
        "{}\n...(truncated, {} chars total)",
        truncate_utf8(text, max_chars),
        text.len()
    )
}

// ─── Tests ───────────────────────────────────────────────────────────────────
