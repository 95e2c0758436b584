//! Shared error type across npds crates.

use thiserror::Error;

/// Stable error codes (used in logs, NACK details, and admin API bodies).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Resource violates the policy data-model invariants.
    MalformedResource,
    /// Discovery stream failed (reset, timeout, server close).
    StreamTransport,
    /// Response was stale (replayed nonce or regressed version).
    StaleNonce,
    /// Flow descriptor is missing fields or out of range.
    InvalidFlow,
    /// Resource type URL not handled by this engine.
    UnsupportedType,
    /// Configuration rejected at load time.
    BadConfig,
    /// Named filter is not installed.
    NotFound,
    /// Internal error.
    Internal,
}

impl ErrorCode {
    /// String representation used in JSON responses and NACK details.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::MalformedResource => "MALFORMED_RESOURCE",
            ErrorCode::StreamTransport => "STREAM_TRANSPORT",
            ErrorCode::StaleNonce => "STALE_NONCE",
            ErrorCode::InvalidFlow => "INVALID_FLOW",
            ErrorCode::UnsupportedType => "UNSUPPORTED_TYPE",
            ErrorCode::BadConfig => "BAD_CONFIG",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Internal => "INTERNAL",
        }
    }
}

/// Shared result type.
pub type Result<T> = std::result::Result<T, NpdsError>;

/// Unified error type used by core and agent.
#[derive(Debug, Error)]
pub enum NpdsError {
    #[error("malformed resource {name:?}: {reason}")]
    MalformedResource { name: String, reason: String },
    #[error("stream transport: {0}")]
    StreamTransport(String),
    #[error("stale response: {0}")]
    StaleNonce(String),
    #[error("invalid flow: {0}")]
    InvalidFlow(String),
    #[error("unsupported resource type: {0}")]
    UnsupportedType(String),
    #[error("bad config: {0}")]
    BadConfig(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl NpdsError {
    /// Shorthand for a validation failure on resource `name`.
    pub fn malformed(name: impl Into<String>, reason: impl Into<String>) -> Self {
        NpdsError::MalformedResource {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Map the error to its stable code.
    pub fn code(&self) -> ErrorCode {
        match self {
            NpdsError::MalformedResource { .. } => ErrorCode::MalformedResource,
            NpdsError::StreamTransport(_) => ErrorCode::StreamTransport,
            NpdsError::StaleNonce(_) => ErrorCode::StaleNonce,
            NpdsError::InvalidFlow(_) => ErrorCode::InvalidFlow,
            NpdsError::UnsupportedType(_) => ErrorCode::UnsupportedType,
            NpdsError::BadConfig(_) => ErrorCode::BadConfig,
            NpdsError::NotFound(_) => ErrorCode::NotFound,
            NpdsError::Internal(_) => ErrorCode::Internal,
        }
    }
}
