//! Configuration error types.

use thiserror::Error;

/// Errors raised while locating, loading, or validating the hub config.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No config file could be located.
    #[error("config not found: {reason}")]
    NotFound { reason: String },

    /// The file exists but could not be read.
    #[error("failed to read {path}: {reason}")]
    ReadFailed { path: String, reason: String },

    /// The YAML did not match the expected shape.
    #[error("failed to parse config: {reason}")]
    ParseFailed { reason: String },

    /// Two servers share a name.
    #[error("duplicate server name: '{name}'")]
    DuplicateServer { name: String },

    /// A server definition is unusable.
    #[error("invalid server '{name}': {reason}")]
    InvalidServer { name: String, reason: String },

    /// A group definition is unusable.
    #[error("invalid group '{name}': {reason}")]
    InvalidGroup { name: String, reason: String },

    /// A tuning value is out of range.
    #[error("invalid setting '{field}': {reason}")]
    InvalidSetting { field: String, reason: String },
}
