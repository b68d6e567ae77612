//! Registry error types.

use thiserror::Error;

/// Errors from registry lookups and admin toggles.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No live capability has this key.
    #[error("capability not found: '{key}'")]
    NotFound { key: String },

    /// No group has this name.
    #[error("group not found: '{name}'")]
    GroupNotFound { name: String },
}
