//! Wire-level error taxonomy.
//!
//! [`RpcError`] is what the dispatcher turns every failure into before it reaches a
//! client. Each variant maps to a stable [`ErrorCode`] that callers can match on.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable, machine-readable error codes carried in error envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ParseError,
    InvalidRequest,
    UnsupportedVersion,
    UnknownMethod,
    InvalidParams,
    ShuttingDown,
    CapacityExceeded,
    StorageError,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ParseError => "PARSE_ERROR",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::UnsupportedVersion => "UNSUPPORTED_VERSION",
            Self::UnknownMethod => "UNKNOWN_METHOD",
            Self::InvalidParams => "INVALID_PARAMS",
            Self::ShuttingDown => "SHUTTING_DOWN",
            Self::CapacityExceeded => "CAPACITY_EXCEEDED",
            Self::StorageError => "STORAGE_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("malformed envelope: {0}")]
    Parse(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    #[error("unknown method: {0}")]
    UnknownMethod(String),

    #[error("invalid params for {method}: {reason}")]
    InvalidParams { method: String, reason: String },

    #[error("server is shutting down")]
    ShuttingDown,

    #[error("connection limit reached ({limit})")]
    CapacityExceeded { limit: usize },

    #[error("storage failure: {0:#}")]
    Storage(anyhow::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RpcError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Parse(_) => ErrorCode::ParseError,
            Self::InvalidRequest(_) => ErrorCode::InvalidRequest,
            Self::UnsupportedVersion(_) => ErrorCode::UnsupportedVersion,
            Self::UnknownMethod(_) => ErrorCode::UnknownMethod,
            Self::InvalidParams { .. } => ErrorCode::InvalidParams,
            Self::ShuttingDown => ErrorCode::ShuttingDown,
            Self::CapacityExceeded { .. } => ErrorCode::CapacityExceeded,
            Self::Storage(_) => ErrorCode::StorageError,
            Self::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Optional structured detail attached to the error envelope.
    pub fn data(&self) -> Option<serde_json::Value> {
        match self {
            Self::UnknownMethod(method) => Some(serde_json::json!({
                "method": method,
                "supported": crate::protocol::Method::ALL
                    .iter()
                    .map(|m| m.as_str())
                    .collect::<Vec<_>>(),
            })),
            Self::UnsupportedVersion(_) => Some(serde_json::json!({
                "supported": crate::protocol::PROTOCOL_VERSION,
            })),
            Self::CapacityExceeded { limit } => Some(serde_json::json!({ "limit": limit })),
            Self::InvalidParams { method, .. } => Some(serde_json::json!({ "method": method })),
            _ => None,
        }
    }

    pub fn invalid_params(method: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::InvalidParams {
            method: method.into(),
            reason: reason.to_string(),
        }
    }
}

/// Non-storage failures inside a handler (trajectory tracker, encoding).
impl From<anyhow::Error> for RpcError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(format!("{err:#}"))
    }
}
