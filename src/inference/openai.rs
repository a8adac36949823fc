//! OpenAI Chat Completions wire format.
//!
//! Serialization notes for OpenAI-compatible local runtimes:
//! - `content` must be `""` (not `null`) for assistant messages with tool
//!   calls. Ollama and llama.cpp misinterpret `null` content and fail to
//!   recognize the tool call round-trip pattern.
//! - Tool call arguments travel as a JSON-encoded string.

use serde::{Deserialize, Serialize};

use super::config::ModelConfig;
use super::errors::InferenceError;
use super::gateway::{classify_reply, new_call_id};
use super::types::{ChatMessage, ModelTurn, Role, ToolCall, ToolDefinition};

// ─── Request Types ───────────────────────────────────────────────────────────

/// Request body for `POST /chat/completions`.
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<WireTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    pub max_tokens: u32,
    pub stream: bool,
}

/// A message as OpenAI expects it.
#[derive(Debug, Clone, Serialize)]
pub struct WireMessage {
    pub role: &'static str,
    #[serde(serialize_with = "serialize_content")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<WireToolCall>>,
}

/// Custom serializer for `content`: emit `""` instead of `null` when `None`.
fn serialize_content<S>(value: &Option<String>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match value {
        Some(s) => serializer.serialize_str(s),
        None => serializer.serialize_str(""),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WireTool {
    pub r#type: &'static str,
    pub function: WireFunction,
}

#[derive(Debug, Clone, Serialize)]
pub struct WireFunction {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct WireToolCall {
    pub id: String,
    pub r#type: &'static str,
    pub function: WireFunctionCall,
}

#[derive(Debug, Clone, Serialize)]
pub struct WireFunctionCall {
    pub name: String,
    pub arguments: String,
}

/// Build the request body for one turn.
pub fn build_request(
    config: &ModelConfig,
    transcript: &[ChatMessage],
    manifest: &[ToolDefinition],
) -> ChatCompletionRequest {
    let mut messages = Vec::with_capacity(transcript.len() + 1);

    if let Some(prompt) = config.system_prompt.as_deref().filter(|p| !p.is_empty()) {
        messages.push(WireMessage {
            role: "system",
            content: Some(prompt.to_string()),
            tool_call_id: None,
            tool_calls: None,
        });
    }

    for msg in transcript {
        messages.push(match msg.role {
            Role::User => WireMessage {
                role: "user",
                content: msg.content.clone(),
                tool_call_id: None,
                tool_calls: None,
            },
            Role::Assistant => WireMessage {
                role: "assistant",
                content: msg.content.clone(),
                tool_call_id: None,
                tool_calls: msg.tool_calls.as_ref().map(|calls| {
                    calls
                        .iter()
                        .map(|c| WireToolCall {
                            id: c.id.clone(),
                            r#type: "function",
                            function: WireFunctionCall {
                                name: c.name.clone(),
                                arguments: c.arguments.to_string(),
                            },
                        })
                        .collect()
                }),
            },
            Role::Tool => WireMessage {
                role: "tool",
                content: msg.content.clone(),
                tool_call_id: msg.tool_call_id.clone(),
                tool_calls: None,
            },
        });
    }

    let tools: Vec<WireTool> = manifest
        .iter()
        .map(|t| WireTool {
            r#type: "function",
            function: WireFunction {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.schema_or_empty(),
            },
        })
        .collect();

    ChatCompletionRequest {
        model: config.model.clone(),
        messages,
        tool_choice: (!tools.is_empty()).then(|| "auto".to_string()),
        tools,
        temperature: config.temperature,
        max_tokens: config.max_tokens,
        stream: false,
    }
}

// ─── Response Parsing ────────────────────────────────────────────────────────

/// Parse a non-streaming chat completion body into a `ModelTurn`.
pub fn parse_response(body: &str) -> Result<ModelTurn, InferenceError> {
    #[derive(Deserialize)]
    struct Response {
        #[serde(default)]
        choices: Vec<Choice>,
    }

    #[derive(Deserialize)]
    struct Choice {
        message: Message,
    }

    #[derive(Deserialize)]
    struct Message {
        content: Option<String>,
        tool_calls: Option<Vec<WireCall>>,
    }

    #[derive(Deserialize)]
    struct WireCall {
        id: Option<String>,
        function: Function,
    }

    #[derive(Deserialize)]
    struct Function {
        name: String,
        /// Usually a JSON string; some runtimes send the object directly.
        #[serde(default)]
        arguments: serde_json::Value,
    }

    let resp: Response = serde_json::from_str(body).map_err(|e| InferenceError::MalformedReply {
        reason: format!("failed to parse chat completion: {e}"),
    })?;

    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or(InferenceError::MalformedReply {
            reason: "empty choices array".into(),
        })?;

    let mut calls = Vec::new();
    for tc in choice.message.tool_calls.unwrap_or_default() {
        if tc.function.name.trim().is_empty() {
            return Err(InferenceError::MalformedReply {
                reason: "tool call without a function name".into(),
            });
        }
        calls.push(ToolCall {
            id: tc.id.unwrap_or_else(new_call_id),
            arguments: parse_arguments(&tc.function.name, tc.function.arguments)?,
            name: tc.function.name,
        });
    }

    classify_reply(choice.message.content, calls)
}

/// Decode tool call arguments, which arrive JSON-encoded inside a string.
fn parse_arguments(
    tool: &str,
    raw: serde_json::Value,
) -> Result<serde_json::Value, InferenceError> {
    match raw {
        serde_json::Value::Null => Ok(serde_json::json!({})),
        serde_json::Value::String(s) if s.trim().is_empty() => Ok(serde_json::json!({})),
        serde_json::Value::String(s) => {
            serde_json::from_str(&s).map_err(|e| InferenceError::MalformedReply {
                reason: format!("invalid JSON arguments for '{tool}': {e}"),
            })
        }
        other => Ok(other),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::config::ApiFormat;

    fn config() -> ModelConfig {
        ModelConfig {
            format: ApiFormat::Openai,
            base_url: "http://localhost:11434/v1".into(),
            model: "qwen2.5".into(),
            api_key: None,
            max_tokens: 512,
            temperature: Some(0.2),
            system_prompt: Some("You are helpful.".into()),
            request_timeout_secs: 30,
            anthropic_version: "2023-06-01".into(),
        }
    }

    #[test]
    fn test_build_request_round_trip_shapes() {
        let call = ToolCall {
            id: "call_1".into(),
            name: "chat_search".into(),
            arguments: serde_json::json!({"query": "Q3 roadmap"}),
        };
        let transcript = vec![
            ChatMessage::user("What did the team decide about the Q3 roadmap?"),
            ChatMessage::assistant_tool_calls(None, vec![call]),
            ChatMessage::tool_result("call_1", "chat_search", "ship v2 in August", false),
        ];
        let manifest = vec![ToolDefinition {
            name: "chat_search".into(),
            description: "Search chat history".into(),
            input_schema: serde_json::Value::Null,
        }];

        let body = serde_json::to_value(build_request(&config(), &transcript, &manifest)).unwrap();
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[2]["role"], "assistant");
        assert_eq!(messages[2]["content"], "");
        assert_eq!(
            messages[2]["tool_calls"][0]["function"]["arguments"],
            r#"{"query":"Q3 roadmap"}"#
        );
        assert_eq!(messages[3]["role"], "tool");
        assert_eq!(messages[3]["tool_call_id"], "call_1");

        assert_eq!(body["tool_choice"], "auto");
        assert_eq!(body["tools"][0]["function"]["parameters"]["type"], "object");
        assert_eq!(body["stream"], false);
    }

    #[test]
    fn test_tools_omitted_when_manifest_empty() {
        let body = serde_json::to_value(build_request(&config(), &[ChatMessage::user("hi")], &[]))
            .unwrap();
        assert!(body.get("tools").is_none());
        assert!(body.get("tool_choice").is_none());
    }

    #[test]
    fn test_parse_final_answer() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"Hello!"},"finish_reason":"stop"}]}"#;
        assert_eq!(
            parse_response(body).unwrap(),
            ModelTurn::FinalAnswer("Hello!".into())
        );
    }

    #[test]
    fn test_parse_tool_calls() {
        let body = r#"{
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [
                        {"id": "call_a", "type": "function",
                         "function": {"name": "search", "arguments": "{\"q\":\"rust\"}"}},
                        {"type": "function",
                         "function": {"name": "fetch", "arguments": ""}}
                    ]
                },
                "finish_reason": "tool_calls"
            }]
        }"#;
        match parse_response(body).unwrap() {
            ModelTurn::ToolRequests { text, calls } => {
                assert!(text.is_none());
                assert_eq!(calls[0].id, "call_a");
                assert_eq!(calls[0].arguments["q"], "rust");
                assert!(calls[1].id.starts_with("call_"));
                assert_eq!(calls[1].arguments, serde_json::json!({}));
            }
            other => panic!("expected tool requests, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_errors_are_malformed() {
        for body in [
            "not json",
            r#"{"choices":[]}"#,
            r#"{"choices":[{"message":{"content":""}}]}"#,
            r#"{"choices":[{"message":{"tool_calls":[{"function":{"name":"x","arguments":"{bad"}}]}}]}"#,
        ] {
            assert!(
                matches!(parse_response(body), Err(InferenceError::MalformedReply { .. })),
                "expected MalformedReply for {body}"
            );
        }
    }
}
