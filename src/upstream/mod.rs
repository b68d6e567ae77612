//! Upstream servers: transports, supervised connections, and reconnect policy.
//!
//! Architecture:
//! - `transport`: one adapter per connection kind behind the `Transport` trait
//! - `connection`: handshake, discovery, calls, and health for one server
//! - `supervisor`: one task per enabled server, reconnect with backoff,
//!   atomic publication into the capability registry
//! - `backoff`: exponential delay with cap, jitter, and an attempt ceiling

pub mod backoff;
pub mod connection;
pub mod errors;
pub mod supervisor;
pub mod transport;
pub mod types;

pub use backoff::BackoffPolicy;
pub use connection::{ConnectionState, HealthThresholds, ServerStatus, UpstreamConnection};
pub use errors::UpstreamError;
pub use supervisor::Supervisor;
pub use transport::{Connector, DefaultConnector, Transport};
pub use types::{TransportKind, UpstreamServerSpec};
