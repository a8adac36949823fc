//! Inference error types.
//!
//! All errors implement `std::error::Error` via `thiserror`. Structured logging
//! is the caller's responsibility; these types carry the context needed to
//! build meaningful log entries and to decide whether a retry makes sense.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during inference operations.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// The endpoint asked us to slow down (HTTP 429, Anthropic 529).
    #[error("rate limited by model endpoint (HTTP {status}): {body}")]
    RateLimited {
        status: u16,
        /// Seconds from a `Retry-After` header, when the endpoint sent one.
        retry_after_secs: Option<u64>,
        body: String,
    },

    /// Credentials were missing or refused (HTTP 401/403).
    #[error("model endpoint rejected credentials (HTTP {status}): {body}")]
    Auth {
        status: u16,
        body: String,
    },

    /// Connection failure, request timeout, or HTTP 5xx.
    #[error("network error talking to {endpoint}: {reason}")]
    Network {
        endpoint: String,
        reason: String,
    },

    /// The reply could not be understood as either an answer or tool calls.
    #[error("malformed model reply: {reason}")]
    MalformedReply {
        reason: String,
    },

    /// Any other non-2xx HTTP response.
    #[error("HTTP {status}: {body}")]
    Rejected {
        status: u16,
        body: String,
    },

    /// Configuration loading or validation error.
    #[error("config error: {reason}")]
    ConfigError {
        reason: String,
    },
}

impl InferenceError {
    /// Classify a non-success HTTP status.
    pub fn from_status(
        endpoint: &str,
        status: u16,
        body: String,
        retry_after_secs: Option<u64>,
    ) -> Self {
        match status {
            401 | 403 => InferenceError::Auth { status, body },
            429 | 529 => InferenceError::RateLimited {
                status,
                retry_after_secs,
                body,
            },
            408 | 500..=599 => InferenceError::Network {
                endpoint: endpoint.to_string(),
                reason: format!("HTTP {status}: {body}"),
            },
            _ => InferenceError::Rejected { status, body },
        }
    }

    /// Whether repeating the same request could succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            InferenceError::RateLimited { .. } | InferenceError::Network { .. }
        )
    }

    /// Server-requested delay before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            InferenceError::RateLimited {
                retry_after_secs: Some(secs),
                ..
            } => Some(Duration::from_secs(*secs)),
            _ => None,
        }
    }
}
