//! Host configuration loading (`mcp-host.yaml`).
//!
//! One YAML file describes the model endpoint, the tool servers to launch,
//! and the orchestration limits. String values may reference environment
//! variables as `${VAR}` or `${VAR:-default}` so credentials never have to
//! live in the file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::inference::config::ModelConfig;
use crate::mcp_client::session::{
    SessionOptions, DEFAULT_DEGRADED_AFTER_TIMEOUTS, DEFAULT_HANDSHAKE_TIMEOUT,
};
use crate::mcp_client::types::ServerConfig;

/// Config file name searched for on disk.
pub const CONFIG_FILE_NAME: &str = "mcp-host.yaml";

/// Environment variable naming an explicit config path.
pub const CONFIG_PATH_ENV: &str = "MCP_HOST_CONFIG";

/// Errors raised while locating or parsing the config.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not find mcp-host.yaml (set MCP_HOST_CONFIG or pass a path)")]
    NotFound,

    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse config: {reason}")]
    Parse { reason: String },
}

// ─── Public Types ────────────────────────────────────────────────────────────

/// Top-level configuration (mirrors `mcp-host.yaml`).
#[derive(Debug, Clone, Deserialize)]
pub struct HostConfig {
    pub model: ModelConfig,
    /// Tool servers by name.
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,
    /// Optional allowlist of server names to start.
    ///
    /// When set, only servers whose names appear in this list are started.
    /// Default: `None` (every configured server is started).
    #[serde(default)]
    pub enabled_servers: Option<Vec<String>>,
    #[serde(default)]
    pub agent: AgentConfig,
}

/// Orchestration limits and timeouts (the `agent` section).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Tool-invocation rounds allowed per query.
    pub max_tool_rounds: usize,
    /// Per-call timeout for `tools/call`.
    pub call_timeout_ms: u64,
    /// Extra attempts for a tool call that timed out.
    pub timeout_retries: u32,
    /// Consecutive timeouts after which a session is Degraded.
    pub degraded_after_timeouts: u32,
    pub handshake_timeout_secs: u64,
    /// Extra attempts for rate-limited or network-failed model requests.
    pub gateway_retries: u32,
    pub gateway_retry_base_ms: u64,
    /// Tool output longer than this is truncated before the model sees it.
    pub max_tool_result_chars: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: 10,
            call_timeout_ms: 30_000,
            timeout_retries: 1,
            degraded_after_timeouts: DEFAULT_DEGRADED_AFTER_TIMEOUTS,
            handshake_timeout_secs: DEFAULT_HANDSHAKE_TIMEOUT.as_secs(),
            gateway_retries: 2,
            gateway_retry_base_ms: 500,
            max_tool_result_chars: 6_000,
        }
    }
}

impl AgentConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn gateway_retry_base(&self) -> Duration {
        Duration::from_millis(self.gateway_retry_base_ms)
    }

    /// Session tunables derived from this config.
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            degraded_after_timeouts: self.degraded_after_timeouts.max(1),
        }
    }
}

impl HostConfig {
    /// The servers to start, after applying `enabled_servers`.
    pub fn active_servers(&self) -> BTreeMap<String, ServerConfig> {
        let Some(allowed) = &self.enabled_servers else {
            return self.servers.clone();
        };

        let before = self.servers.len();
        let filtered: BTreeMap<String, ServerConfig> = self
            .servers
            .iter()
            .filter(|(name, _)| allowed.iter().any(|a| a == *name))
            .map(|(name, cfg)| (name.clone(), cfg.clone()))
            .collect();

        for name in allowed {
            if !self.servers.contains_key(name) {
                tracing::warn!(server = %name, "enabled_servers names a server that is not configured");
            }
        }
        tracing::info!(
            before,
            after = filtered.len(),
            "filtered servers by enabled_servers allowlist"
        );
        filtered
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate the config file.
///
/// Checks `MCP_HOST_CONFIG`, then searches upward from `start`, then the
/// platform config directory (`~/.config/mcp-host/` on Linux).
pub fn find_config_path(start: &Path) -> Result<PathBuf, ConfigError> {
    // 1. Check env var
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        let candidate = PathBuf::from(expand_tilde(&path));
        if candidate.exists() {
            return Ok(candidate);
        }
        tracing::warn!(path = %candidate.display(), "MCP_HOST_CONFIG points at a missing file");
    }

    // 2. Walk upward from `start`
    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.exists() {
            return Ok(candidate);
        }
        if !dir.pop() {
            break;
        }
    }

    // 3. Platform config dir
    if let Some(config_dir) = dirs::config_dir() {
        let candidate = config_dir.join("mcp-host").join(CONFIG_FILE_NAME);
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    Err(ConfigError::NotFound)
}

/// Load and parse the host configuration file.
pub fn load_host_config(path: &Path) -> Result<HostConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    parse_host_config(&raw)
}

/// Parse config text, performing environment-variable interpolation first.
pub fn parse_host_config(raw: &str) -> Result<HostConfig, ConfigError> {
    let interpolated = interpolate_env_vars(raw);
    serde_yaml::from_str(&interpolated).map_err(|e| ConfigError::Parse {
        reason: e.to_string(),
    })
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((var_name, default)) => {
            std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
        }
        None => std::env::var(expr).unwrap_or_default(),
    }
}

fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
