//! Shared types across the agent core.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::inference::types::ChatMessage;

// ─── Loop State ──────────────────────────────────────────────────────────────

/// Where the orchestration loop is within the current query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    /// No query in progress.
    Idle,
    /// Waiting on the model.
    AwaitingModel,
    /// Tool calls are in flight.
    Invoking,
    /// The model produced its final answer.
    Answering,
    /// The last query ended in a failure.
    Failed,
}

// ─── Outcomes ────────────────────────────────────────────────────────────────

/// Why a query failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A tool server could not be started or reached.
    Connection,
    /// A tool server's handshake failed or was incompatible.
    Handshake,
    /// An operation exceeded its deadline.
    Timeout,
    /// A tool name could not be resolved.
    UnknownTool,
    /// The model endpoint kept rate-limiting after all retries.
    RateLimit,
    /// The model endpoint was unreachable after all retries.
    Network,
    /// The model endpoint refused our credentials.
    Auth,
    /// The model's reply was neither an answer nor tool calls.
    MalformedReply,
    /// The model kept requesting tools past the round limit.
    IterationLimitExceeded,
    /// The caller cancelled the query.
    Cancelled,
    /// The model endpoint rejected the request outright.
    GatewayRejected,
    /// Servers are configured but none is usable.
    NoServersAvailable,
    /// The transcript would have been left inconsistent.
    Transcript,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Connection => "connection",
            FailureKind::Handshake => "handshake",
            FailureKind::Timeout => "timeout",
            FailureKind::UnknownTool => "unknown_tool",
            FailureKind::RateLimit => "rate_limit",
            FailureKind::Network => "network",
            FailureKind::Auth => "auth",
            FailureKind::MalformedReply => "malformed_reply",
            FailureKind::IterationLimitExceeded => "iteration_limit_exceeded",
            FailureKind::Cancelled => "cancelled",
            FailureKind::GatewayRejected => "gateway_rejected",
            FailureKind::NoServersAvailable => "no_servers_available",
            FailureKind::Transcript => "transcript",
        }
    }

    /// Failures after which no further query is accepted until the
    /// orchestrator is re-established.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(self, FailureKind::Auth | FailureKind::Handshake)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A query that ended without an answer.
///
/// Carries the transcript as it stood when the query failed so the caller
/// can show or log how far it got.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
    pub transcript: Vec<ChatMessage>,
}

/// A successfully answered query.
#[derive(Debug, Clone, PartialEq)]
pub struct Answer {
    pub text: String,
    /// Tool-invocation rounds used.
    pub rounds: usize,
    /// Tool calls dispatched across all rounds.
    pub tool_calls: usize,
}
