//! Dispatch error types and the stable error kinds callers branch on.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::upstream::UpstreamError;

/// Stable failure category of a dispatched call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No channel to the owning server could be used.
    ConnectError,
    /// The channel was lost while the call was in flight.
    TransportError,
    /// The call's deadline passed.
    CallTimeout,
    /// The capability, server, or group does not resolve.
    NotFound,
    /// The capability exists but is administratively switched off.
    Disabled,
    /// Smart routing was requested but cannot run.
    RoutingUnavailable,
    /// The upstream server reported a failure for the call.
    UpstreamApplicationError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ConnectError => "connect_error",
            ErrorKind::TransportError => "transport_error",
            ErrorKind::CallTimeout => "call_timeout",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Disabled => "disabled",
            ErrorKind::RoutingUnavailable => "routing_unavailable",
            ErrorKind::UpstreamApplicationError => "upstream_application_error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by the request dispatcher.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("not found: {what}")]
    NotFound { what: String },

    #[error("capability '{key}' is disabled")]
    Disabled { key: String },

    #[error("server '{server}' is unreachable: {reason}")]
    Connect { server: String, reason: String },

    #[error("transport to server '{server}' failed: {reason}")]
    Transport { server: String, reason: String },

    #[error("call to server '{server}' timed out after {timeout_ms}ms")]
    Timeout { server: String, timeout_ms: u64 },

    #[error("smart routing unavailable: {reason}")]
    RoutingUnavailable { reason: String },

    /// Passed through from the upstream server unchanged.
    #[error("server '{server}' returned an error: {message}")]
    Application {
        server: String,
        code: Option<i32>,
        message: String,
        data: Option<serde_json::Value>,
    },
}

impl DispatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DispatchError::NotFound { .. } => ErrorKind::NotFound,
            DispatchError::Disabled { .. } => ErrorKind::Disabled,
            DispatchError::Connect { .. } => ErrorKind::ConnectError,
            DispatchError::Transport { .. } => ErrorKind::TransportError,
            DispatchError::Timeout { .. } => ErrorKind::CallTimeout,
            DispatchError::RoutingUnavailable { .. } => ErrorKind::RoutingUnavailable,
            DispatchError::Application { .. } => ErrorKind::UpstreamApplicationError,
        }
    }

    /// Structured detail for the result envelope, when there is any.
    pub fn data(&self) -> Option<serde_json::Value> {
        match self {
            DispatchError::Application { code, data, .. } => match (code, data) {
                (None, None) => None,
                (code, data) => Some(serde_json::json!({ "code": code, "data": data })),
            },
            _ => None,
        }
    }

    /// Classify an error from an upstream call to `server`.
    pub fn from_upstream(server: &str, error: UpstreamError) -> Self {
        match error {
            UpstreamError::Timeout { timeout_ms, .. } => DispatchError::Timeout {
                server: server.to_string(),
                timeout_ms,
            },
            UpstreamError::ServerError {
                code,
                message,
                data,
            } => DispatchError::Application {
                server: server.to_string(),
                code: Some(code),
                message,
                data,
            },
            e if e.is_connect_failure() => DispatchError::Connect {
                server: server.to_string(),
                reason: e.to_string(),
            },
            e => DispatchError::Transport {
                server: server.to_string(),
                reason: e.to_string(),
            },
        }
    }
}
