//! Gateway-wide error kinds.

use thiserror::Error;

/// Error surfaced by the core runtime to its callers.
///
/// Variant names mirror failure *kinds*, not HTTP status codes — the HTTP
/// layer (out of the core's concern) maps these to status codes at the
/// boundary.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GatewayError {
    /// Unreachable, refused, TLS failure, or timeout talking to a worker.
    #[error("worker transport error: {0}")]
    Transport(String),

    /// Worker returned a non-200/non-object body, or one missing the
    /// expected field (e.g. `prompt_id`).
    #[error("worker protocol error: {0}")]
    Protocol(String),

    /// No enabled, healthy worker was available to serve the request.
    #[error("no capacity: no healthy worker available")]
    NoCapacity,

    /// Unknown prompt_id, gateway_job_id, or worker_id.
    #[error("not found: {0}")]
    NotFound(String),

    /// Caller-supplied input failed validation.
    #[error("validation error: {0}")]
    Validation(String),
}

impl GatewayError {
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
