//! Smart routing error types.

use thiserror::Error;

/// Errors from the embedding provider and the semantic index.
#[derive(Debug, Error)]
pub enum SmartError {
    /// Smart routing is switched off in the settings.
    #[error("smart routing is disabled")]
    Disabled,

    #[error("embedding request failed (HTTP {status}): {body}")]
    HttpError { status: u16, body: String },

    #[error("embedding request failed: {reason}")]
    RequestFailed { reason: String },

    #[error("empty embedding response for {count} inputs")]
    EmptyResponse { count: usize },

    #[error("embedding count mismatch: sent {expected} inputs, got {actual} vectors")]
    CountMismatch { expected: usize, actual: usize },

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}
