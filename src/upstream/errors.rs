//! Upstream connection error types.

use thiserror::Error;

/// Errors that can occur while opening, driving, or calling an upstream server.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// A server process failed to start.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed { name: String, reason: String },

    /// A network endpoint could not be reached (DNS, TCP, TLS, HTTP status).
    #[error("failed to connect to server '{name}': {reason}")]
    ConnectFailed { name: String, reason: String },

    /// The initialization handshake failed or was rejected.
    #[error("server '{name}' initialization failed: {reason}")]
    InitFailed { name: String, reason: String },

    /// The channel was lost mid-use (I/O error, stream closed, process exited).
    #[error("transport error for server '{server}': {reason}")]
    TransportError { server: String, reason: String },

    /// A message could not be understood.
    #[error("protocol error for server '{server}': {reason}")]
    ProtocolError { server: String, reason: String },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// A request did not complete within its deadline.
    #[error("request '{method}' to server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        method: String,
        timeout_ms: u64,
    },

    /// The connection has no live channel right now.
    #[error("server '{name}' is not connected ({state})")]
    NotConnected { name: String, state: String },

    /// No server with this name is managed.
    #[error("unknown server: '{name}'")]
    UnknownServer { name: String },
}

impl UpstreamError {
    /// Whether this error means a channel could not be established at all.
    pub fn is_connect_failure(&self) -> bool {
        matches!(
            self,
            UpstreamError::SpawnFailed { .. }
                | UpstreamError::ConnectFailed { .. }
                | UpstreamError::InitFailed { .. }
                | UpstreamError::NotConnected { .. }
                | UpstreamError::UnknownServer { .. }
        )
    }

    /// Whether this error indicates the channel itself is unhealthy.
    pub fn is_channel_failure(&self) -> bool {
        matches!(
            self,
            UpstreamError::TransportError { .. } | UpstreamError::ProtocolError { .. }
        )
    }
}
