//! Agent Core error types.

use thiserror::Error;

/// Errors that can occur during agent core operations.
#[derive(Debug, Error)]
pub enum AgentError {
    /// An append would break the transcript's call/result ordering.
    #[error("transcript ordering violated: {reason}")]
    TranscriptOrder { reason: String },

    /// Tool results do not answer the outstanding tool calls one-to-one.
    #[error("tool results do not match requests: expected [{}], got [{}]", expected.join(", "), got.join(", "))]
    ResultMismatch {
        expected: Vec<String>,
        got: Vec<String>,
    },
}
