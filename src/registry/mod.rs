//! Capability registry: namespaced tools, prompts, and resources from every
//! live upstream server, plus groups and owner visibility.
//!
//! Written by the supervisor (per-server publish/withdraw) and by admin
//! toggles. Read concurrently by the dispatcher, the smart router, and the
//! presentation layer.

pub mod errors;
pub mod store;
pub mod types;

pub use errors::RegistryError;
pub use store::CapabilityRegistry;
pub use types::{
    Capability, CapabilityFilter, CapabilityKind, CapabilityView, Group, GroupMember,
    NamespacedKey, ToolFilter, Viewer, NAMESPACE_SEPARATOR,
};
