//! Tuning knobs for the supervisor, dispatcher, and smart router.
//!
//! Every field has a default so a config file may omit the whole
//! `settings` block.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::upstream::backoff::BackoffPolicy;
use crate::upstream::connection::HealthThresholds;

/// All hub settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubSettings {
    pub supervisor: SupervisorSettings,
    pub dispatch: DispatchSettings,
    pub smart: SmartSettings,
}

// ─── Supervisor ──────────────────────────────────────────────────────────────

/// Connection supervision settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    /// Connection attempts allowed to run at the same time.
    pub max_concurrent_starts: usize,
    /// Deadline for open + handshake + discovery.
    pub init_timeout_ms: u64,
    /// Interval between liveness probes. Zero disables probing.
    pub probe_interval_ms: u64,
    pub probe_timeout_ms: u64,
    /// Consecutive call timeouts before a connection is marked degraded.
    pub degraded_threshold: u32,
    /// Consecutive probe or channel failures before it is disconnected.
    pub disconnect_threshold: u32,
    pub backoff: BackoffPolicy,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            max_concurrent_starts: 8,
            init_timeout_ms: 30_000,
            probe_interval_ms: 30_000,
            probe_timeout_ms: 5_000,
            degraded_threshold: 3,
            disconnect_threshold: 3,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl SupervisorSettings {
    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn probe_interval(&self) -> Option<Duration> {
        (self.probe_interval_ms > 0).then(|| Duration::from_millis(self.probe_interval_ms))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn health(&self) -> HealthThresholds {
        HealthThresholds {
            degraded_after_timeouts: self.degraded_threshold.max(1),
            disconnect_after_failures: self.disconnect_threshold.max(1),
        }
    }
}

// ─── Dispatch ────────────────────────────────────────────────────────────────

/// Per-call deadlines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    /// Default deadline when the caller supplies none.
    pub call_timeout_ms: u64,
    /// Ceiling applied to calls routed to a degraded connection.
    pub degraded_call_timeout_ms: u64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            call_timeout_ms: 30_000,
            degraded_call_timeout_ms: 5_000,
        }
    }
}

impl DispatchSettings {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn degraded_call_timeout(&self) -> Duration {
        Duration::from_millis(self.degraded_call_timeout_ms)
    }
}

// ─── Smart Routing ───────────────────────────────────────────────────────────

/// Semantic routing settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmartSettings {
    /// Whether to build the semantic index at all.
    pub enabled: bool,
    /// OpenAI-compatible base URL; `/embeddings` is appended.
    pub endpoint: String,
    pub model: String,
    /// Maximum results returned by a query.
    pub top_k: usize,
    /// Minimum cosine similarity for a confident match.
    pub min_relevance: f32,
    pub request_timeout_ms: u64,
}

impl Default for SmartSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: "http://localhost:11434/v1".into(),
            model: "nomic-embed-text".into(),
            top_k: 5,
            min_relevance: 0.3,
            request_timeout_ms: 30_000,
        }
    }
}

impl SmartSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
