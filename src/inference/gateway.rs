//! The seam between the orchestrator and whatever model answers it.

use std::collections::HashSet;

use async_trait::async_trait;

use super::errors::InferenceError;
use super::types::{ChatMessage, ModelTurn, ToolCall, ToolDefinition};

/// A model that, given a transcript and the tools on offer, either answers
/// or asks for tool calls.
///
/// Implementations hold no conversation state: every call is a function of
/// its arguments alone.
#[async_trait]
pub trait Gateway: Send + Sync {
    async fn converse(
        &self,
        transcript: &[ChatMessage],
        manifest: &[ToolDefinition],
    ) -> Result<ModelTurn, InferenceError>;
}

/// Generate a fresh tool call id.
pub fn new_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}

/// Give every call a non-empty id that is unique within the reply.
///
/// Models occasionally omit ids or repeat one; results are correlated by id,
/// so either would make two results indistinguishable.
pub fn ensure_unique_call_ids(calls: &mut [ToolCall]) {
    let mut seen = HashSet::new();
    for call in calls.iter_mut() {
        if call.id.trim().is_empty() || !seen.insert(call.id.clone()) {
            let replacement = new_call_id();
            tracing::debug!(
                tool = %call.name,
                old_id = %call.id,
                new_id = %replacement,
                "replacing missing or duplicate tool call id"
            );
            call.id = replacement;
            seen.insert(call.id.clone());
        }
    }
}

/// Turn the pieces of a parsed reply into a `ModelTurn`.
///
/// Tool calls win over text; a reply with neither is malformed.
pub fn classify_reply(
    text: Option<String>,
    mut calls: Vec<ToolCall>,
) -> Result<ModelTurn, InferenceError> {
    let text = text.filter(|t| !t.trim().is_empty());

    if !calls.is_empty() {
        ensure_unique_call_ids(&mut calls);
        return Ok(ModelTurn::ToolRequests { text, calls });
    }

    match text {
        Some(answer) => Ok(ModelTurn::FinalAnswer(answer)),
        None => Err(InferenceError::MalformedReply {
            reason: "reply contained neither text nor tool calls".into(),
        }),
    }
}
