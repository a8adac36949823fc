//! ToolRouter: dispatches model tool calls to MCP servers.
//!
//! The ToolRouter is the bridge between the model's tool call decisions and
//! the MCP server sessions. It handles:
//! - Concurrent fan-out of every call in one model reply
//! - Fan-in with results in the order the model requested them
//! - Retry with exponential backoff for calls that timed out
//! - Cancellation of everything in flight

use std::time::Duration;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::inference::types::ToolCall;
use crate::mcp_client::registry::ToolRegistry;
use crate::mcp_client::types::{ToolCallResult, ToolErrorKind};

// ─── Constants ──────────────────────────────────────────────────────────────

/// Base delay between timeout retries (doubles each attempt).
const RETRY_BASE_DELAY: Duration = Duration::from_millis(250);

/// Upper bound on a single timeout-retry sleep.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// `base * 2^attempt`, saturating, capped at `max`.
pub(crate) fn backoff_delay(base: Duration, attempt: u32, max: Duration) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt)).min(max)
}

// ─── ToolRouter ─────────────────────────────────────────────────────────────

/// Dispatches tool calls from the model through the current tool registry.
#[derive(Debug, Clone)]
pub struct ToolRouter {
    call_timeout: Duration,
    timeout_retries: u32,
    retry_base_delay: Duration,
}

impl ToolRouter {
    pub fn new(call_timeout: Duration, timeout_retries: u32) -> Self {
        Self {
            call_timeout,
            timeout_retries,
            retry_base_delay: RETRY_BASE_DELAY,
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(config.call_timeout(), config.timeout_retries)
    }

    /// Override the backoff base (tests use a short one).
    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    // ─── Dispatch ───────────────────────────────────────────────────────

    /// Dispatch a batch of tool calls from the model.
    ///
    /// All calls run concurrently. Returns exactly one result per call, in
    /// the order of `tool_calls`, once every call has finished.
    pub async fn dispatch_tool_calls(
        &self,
        registry: &ToolRegistry,
        tool_calls: &[ToolCall],
        cancel: &CancellationToken,
    ) -> Vec<ToolCallResult> {
        let results = join_all(
            tool_calls
                .iter()
                .map(|tc| self.dispatch_single(registry, tc, cancel)),
        )
        .await;

        let failed = results.iter().filter(|r| !r.success).count();
        tracing::info!(
            calls = results.len(),
            failed,
            "tool batch completed"
        );
        results
    }

    /// Dispatch one call, retrying timeouts.
    ///
    /// Each retry is a fresh `tools/call` request, so it gets its own
    /// JSON-RPC id; the model-facing call id is unchanged.
    pub async fn dispatch_single(
        &self,
        registry: &ToolRegistry,
        tool_call: &ToolCall,
        cancel: &CancellationToken,
    ) -> ToolCallResult {
        let mut attempt = 0;
        let mut waited_ms = 0u64;

        loop {
            let mut result = registry
                .dispatch(tool_call, self.call_timeout, cancel)
                .await;
            result.execution_time_ms += waited_ms;

            let timed_out = result.error_kind == Some(ToolErrorKind::Timeout);
            if !timed_out || attempt >= self.timeout_retries || cancel.is_cancelled() {
                log_result(&result, attempt);
                return result;
            }

            attempt += 1;
            let delay = backoff_delay(self.retry_base_delay, attempt - 1, MAX_RETRY_DELAY);
            tracing::warn!(
                tool = %tool_call.name,
                call_id = %tool_call.id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "tool call timed out, retrying"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return ToolCallResult::failure(
                        &tool_call.id,
                        &tool_call.name,
                        ToolErrorKind::Cancelled,
                        "query cancelled before retry",
                        result.execution_time_ms,
                    );
                }
                _ = tokio::time::sleep(delay) => {}
            }
            waited_ms = result.execution_time_ms + delay.as_millis() as u64;
        }
    }
}

fn log_result(result: &ToolCallResult, retries: u32) {
    if result.success {
        tracing::info!(
            tool = %result.tool_name,
            call_id = %result.call_id,
            elapsed_ms = result.execution_time_ms,
            retries,
            "tool call succeeded"
        );
    } else {
        tracing::warn!(
            tool = %result.tool_name,
            call_id = %result.call_id,
            kind = result.error_kind.map(|k| k.as_str()).unwrap_or("unknown"),
            error = result.error.as_deref().unwrap_or(""),
            elapsed_ms = result.execution_time_ms,
            retries,
            "tool call failed"
        );
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
