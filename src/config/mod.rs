//! Hub configuration: server definitions, groups, and tuning.
//!
//! The hub never persists configuration. It reads `hub.yaml` at startup and
//! accepts [`ConfigChange`] events afterwards.

pub mod changes;
pub mod errors;
pub mod loader;
pub mod settings;

pub use changes::{diff, ConfigChange};
pub use errors::ConfigError;
pub use loader::{find_config_path, load_config, parse_config, validate, HubConfig};
pub use settings::{DispatchSettings, HubSettings, SmartSettings, SupervisorSettings};
