//! Model endpoint configuration (the `model` section of `mcp-host.yaml`).
//!
//! The endpoint is interchangeable via config: switching from a local
//! OpenAI-compatible server to a hosted Anthropic model is a config change,
//! not a code change.

use serde::Deserialize;

use super::errors::InferenceError;

// ─── Public Types ────────────────────────────────────────────────────────────

/// Which wire format the endpoint speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiFormat {
    /// `POST {base_url}/chat/completions` (OpenAI, Ollama, llama.cpp, vLLM).
    #[default]
    #[serde(alias = "open_ai")]
    Openai,
    /// `POST {base_url}/v1/messages`.
    Anthropic,
}

/// The model endpoint's runtime configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub format: ApiFormat,
    pub base_url: String,
    pub model: String,
    /// Opaque credential. Empty strings (an unset `${VAR}`) count as absent.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Value of the `anthropic-version` header.
    #[serde(default = "default_anthropic_version")]
    pub anthropic_version: String,
}

fn default_max_tokens() -> u32 {
    1024
}
fn default_request_timeout_secs() -> u64 {
    120
}
fn default_anthropic_version() -> String {
    "2023-06-01".to_string()
}

impl ModelConfig {
    /// The credential, if one was actually provided.
    pub fn api_key(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
    }

    /// Full URL of the completion endpoint for the configured format.
    pub fn endpoint_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        match self.format {
            ApiFormat::Openai => format!("{base}/chat/completions"),
            ApiFormat::Anthropic => {
                if base.ends_with("/v1") {
                    format!("{base}/messages")
                } else {
                    format!("{base}/v1/messages")
                }
            }
        }
    }

    /// Reject configurations that cannot produce a working client.
    pub fn validate(&self) -> Result<(), InferenceError> {
        if self.base_url.trim().is_empty() {
            return Err(InferenceError::ConfigError {
                reason: "model.base_url is empty".into(),
            });
        }
        if self.model.trim().is_empty() {
            return Err(InferenceError::ConfigError {
                reason: "model.model is empty".into(),
            });
        }
        if self.format == ApiFormat::Anthropic && self.api_key().is_none() {
            return Err(InferenceError::ConfigError {
                reason: "model.api_key is required for the anthropic format".into(),
            });
        }
        if self.max_tokens == 0 {
            return Err(InferenceError::ConfigError {
                reason: "model.max_tokens must be positive".into(),
            });
        }
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
