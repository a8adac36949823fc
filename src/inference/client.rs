//! HTTP inference client: the production `Gateway`.
//!
//! Sends one non-streaming request per model turn to an OpenAI-compatible or
//! Anthropic endpoint and classifies every failure so the orchestrator can
//! decide between retrying, failing the turn, and failing the session.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;

use super::config::{ApiFormat, ModelConfig};
use super::errors::InferenceError;
use super::gateway::Gateway;
use super::types::{ChatMessage, ModelTurn, ToolDefinition};
use super::{anthropic, openai};

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Error bodies are clipped to this many bytes before they reach logs.
const MAX_ERROR_BODY: usize = 2000;

// ─── InferenceClient ─────────────────────────────────────────────────────────

/// Client for the configured model endpoint.
///
/// Holds no conversation state; the transcript is passed in on every call.
pub struct InferenceClient {
    http: HttpClient,
    config: ModelConfig,
    url: String,
}

impl InferenceClient {
    /// Create a new inference client from the model configuration.
    ///
    /// Does NOT check connectivity; that happens on the first request.
    pub fn from_config(config: ModelConfig) -> Result<Self, InferenceError> {
        config.validate()?;
        let url = config.endpoint_url();

        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| InferenceError::ConfigError {
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self { http, config, url })
    }

    pub fn model_name(&self) -> &str {
        &self.config.model
    }

    pub fn endpoint(&self) -> &str {
        &self.url
    }

    fn build_http_request(
        &self,
        transcript: &[ChatMessage],
        manifest: &[ToolDefinition],
    ) -> reqwest::RequestBuilder {
        let builder = self.http.post(&self.url);
        match self.config.format {
            ApiFormat::Openai => {
                let body = openai::build_request(&self.config, transcript, manifest);
                let builder = builder.json(&body);
                match self.config.api_key() {
                    Some(key) => builder.bearer_auth(key),
                    None => builder,
                }
            }
            ApiFormat::Anthropic => {
                let body = anthropic::build_request(&self.config, transcript, manifest);
                let builder = builder
                    .json(&body)
                    .header("anthropic-version", &self.config.anthropic_version);
                match self.config.api_key() {
                    Some(key) => builder.header("x-api-key", key),
                    None => builder,
                }
            }
        }
    }

    fn parse_body(&self, body: &str) -> Result<ModelTurn, InferenceError> {
        match self.config.format {
            ApiFormat::Openai => openai::parse_response(body),
            ApiFormat::Anthropic => anthropic::parse_response(body),
        }
    }

    fn network_error(&self, err: &reqwest::Error) -> InferenceError {
        let reason = if err.is_timeout() {
            format!("request timed out: {err}")
        } else if err.is_connect() {
            format!("connection failed: {err}")
        } else {
            err.to_string()
        };
        InferenceError::Network {
            endpoint: self.url.clone(),
            reason,
        }
    }
}

#[async_trait]
impl Gateway for InferenceClient {
    async fn converse(
        &self,
        transcript: &[ChatMessage],
        manifest: &[ToolDefinition],
    ) -> Result<ModelTurn, InferenceError> {
        tracing::info!(
            url = %self.url,
            model = %self.config.model,
            message_count = transcript.len(),
            tool_count = manifest.len(),
            "sending model request"
        );

        let response = self
            .build_http_request(transcript, manifest)
            .send()
            .await
            .map_err(|e| self.network_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let mut body = response.text().await.unwrap_or_default();
            truncate_at_char_boundary(&mut body, MAX_ERROR_BODY);
            let err = InferenceError::from_status(&self.url, status.as_u16(), body, retry_after);
            tracing::warn!(status = status.as_u16(), error = %err, "model request failed");
            return Err(err);
        }

        let body = response.text().await.map_err(|e| self.network_error(&e))?;
        let turn = self.parse_body(&body)?;

        match &turn {
            ModelTurn::FinalAnswer(text) => {
                tracing::info!(chars = text.len(), "model produced final answer");
            }
            ModelTurn::ToolRequests { calls, .. } => {
                tracing::info!(
                    count = calls.len(),
                    tools = ?calls.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
                    "model requested tool calls"
                );
            }
        }
        Ok(turn)
    }
}

/// Read `Retry-After` as whole seconds. HTTP-date values are ignored.
fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

fn truncate_at_char_boundary(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
    s.push_str("...(truncated)");
}

// ─── Tests ───────────────────────────────────────────────────────────────────
