//! Anthropic Messages wire format.
//!
//! Differences from the OpenAI shape that matter here:
//! - The system prompt is a top-level field, not a message.
//! - Tool calls are `tool_use` content blocks on the assistant message and
//!   their results are `tool_result` blocks on a *user* message.
//! - Roles must alternate, so consecutive messages that map to the same role
//!   are merged into one message with several content blocks.

use serde::Deserialize;
use serde_json::{json, Value};

use super::config::ModelConfig;
use super::errors::InferenceError;
use super::gateway::{classify_reply, new_call_id};
use super::types::{ChatMessage, ModelTurn, Role, ToolCall, ToolDefinition};

// ─── Request Building ────────────────────────────────────────────────────────

/// Build the request body for one turn.
pub fn build_request(
    config: &ModelConfig,
    transcript: &[ChatMessage],
    manifest: &[ToolDefinition],
) -> Value {
    let mut messages: Vec<(&'static str, Vec<Value>)> = Vec::new();

    for msg in transcript {
        let (role, blocks) = to_blocks(msg);
        if blocks.is_empty() {
            continue;
        }
        match messages.last_mut() {
            Some((last_role, last_blocks)) if *last_role == role => last_blocks.extend(blocks),
            _ => messages.push((role, blocks)),
        }
    }

    let messages: Vec<Value> = messages
        .into_iter()
        .map(|(role, content)| json!({ "role": role, "content": content }))
        .collect();

    let mut body = json!({
        "model": config.model,
        "max_tokens": config.max_tokens,
        "messages": messages,
    });

    if let Some(prompt) = config.system_prompt.as_deref().filter(|p| !p.is_empty()) {
        body["system"] = json!(prompt);
    }
    if let Some(temperature) = config.temperature {
        body["temperature"] = json!(temperature);
    }
    if !manifest.is_empty() {
        body["tools"] = manifest
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.schema_or_empty(),
                })
            })
            .collect();
    }

    body
}

fn to_blocks(msg: &ChatMessage) -> (&'static str, Vec<Value>) {
    let text_block = |text: &Option<String>| {
        text.as_deref()
            .filter(|t| !t.trim().is_empty())
            .map(|t| json!({ "type": "text", "text": t }))
    };

    match msg.role {
        Role::User => ("user", text_block(&msg.content).into_iter().collect()),
        Role::Assistant => {
            let mut blocks: Vec<Value> = text_block(&msg.content).into_iter().collect();
            blocks.extend(msg.calls().iter().map(|c| {
                json!({
                    "type": "tool_use",
                    "id": c.id,
                    "name": c.name,
                    "input": c.arguments,
                })
            }));
            ("assistant", blocks)
        }
        Role::Tool => (
            "user",
            vec![json!({
                "type": "tool_result",
                "tool_use_id": msg.tool_call_id.clone().unwrap_or_default(),
                "content": msg.content.clone().unwrap_or_default(),
                "is_error": msg.is_error,
            })],
        ),
    }
}

// ─── Response Parsing ────────────────────────────────────────────────────────

/// Parse a Messages API response body into a `ModelTurn`.
pub fn parse_response(body: &str) -> Result<ModelTurn, InferenceError> {
    #[derive(Deserialize)]
    struct Response {
        #[serde(default)]
        content: Vec<Block>,
    }

    #[derive(Deserialize)]
    #[serde(tag = "type", rename_all = "snake_case")]
    enum Block {
        Text {
            text: String,
        },
        ToolUse {
            #[serde(default)]
            id: Option<String>,
            name: String,
            #[serde(default)]
            input: Value,
        },
        #[serde(other)]
        Other,
    }

    let resp: Response = serde_json::from_str(body).map_err(|e| InferenceError::MalformedReply {
        reason: format!("failed to parse messages response: {e}"),
    })?;

    let mut texts = Vec::new();
    let mut calls = Vec::new();
    for block in resp.content {
        match block {
            Block::Text { text } => texts.push(text),
            Block::ToolUse { id, name, input } => {
                if name.trim().is_empty() {
                    return Err(InferenceError::MalformedReply {
                        reason: "tool_use block without a name".into(),
                    });
                }
                let arguments = if input.is_null() { json!({}) } else { input };
                if !arguments.is_object() {
                    return Err(InferenceError::MalformedReply {
                        reason: format!("tool_use input for '{name}' is not an object"),
                    });
                }
                calls.push(ToolCall {
                    id: id.unwrap_or_else(new_call_id),
                    name,
                    arguments,
                });
            }
            Block::Other => {}
        }
    }

    let text = (!texts.is_empty()).then(|| texts.join("\n"));
    classify_reply(text, calls)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
