//! Call descriptions and the normalized result envelope.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::{DispatchError, ErrorKind};
use crate::registry::{CapabilityKind, NamespacedKey};

// ─── Scope ───────────────────────────────────────────────────────────────────

/// Where a call may be routed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "name", rename_all = "snake_case")]
pub enum Scope {
    /// Direct lookup across every enabled capability.
    Global,
    Server(String),
    Group(String),
    /// Resolve a free-text intent through the smart router.
    Smart,
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::Global => f.write_str("global"),
            Scope::Server(name) => write!(f, "server:{name}"),
            Scope::Group(name) => write!(f, "group:{name}"),
            Scope::Smart => f.write_str("smart"),
        }
    }
}

impl FromStr for Scope {
    type Err = String;

    /// Parse `global`, `smart`, `server:<name>`, or `group:<name>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "global" => return Ok(Scope::Global),
            "smart" => return Ok(Scope::Smart),
            _ => {}
        }
        match s.split_once(':') {
            Some(("server", name)) if !name.is_empty() => Ok(Scope::Server(name.to_string())),
            Some(("group", name)) if !name.is_empty() => Ok(Scope::Group(name.to_string())),
            _ => Err(format!("invalid scope '{s}' (expected global, smart, server:<name>, or group:<name>)")),
        }
    }
}

// ─── Request ─────────────────────────────────────────────────────────────────

/// One inbound call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRequest {
    pub scope: Scope,
    /// Kind of capability to resolve. Ignored for smart scope, which
    /// considers tools and prompts.
    #[serde(default = "default_kind")]
    pub kind: CapabilityKind,
    /// Namespaced or bare capability name; the intent text for smart scope.
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
    /// Overrides the default per-call timeout.
    #[serde(default, with = "optional_millis")]
    pub deadline: Option<Duration>,
}

fn default_kind() -> CapabilityKind {
    CapabilityKind::Tool
}

impl CallRequest {
    /// A tool call.
    pub fn tool(scope: Scope, name: &str, arguments: serde_json::Value) -> Self {
        Self {
            scope,
            kind: CapabilityKind::Tool,
            name: name.to_string(),
            arguments,
            deadline: None,
        }
    }

    /// A smart-routed call for a free-text intent.
    pub fn smart(intent: &str, arguments: serde_json::Value) -> Self {
        Self::tool(Scope::Smart, intent, arguments)
    }

    pub fn with_kind(mut self, kind: CapabilityKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

mod optional_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

// ─── Outcome ─────────────────────────────────────────────────────────────────

/// A successful call.
#[derive(Debug, Clone, Serialize)]
pub struct CallOutcome {
    pub call_id: Uuid,
    pub key: NamespacedKey,
    pub server: String,
    /// Upstream result, unchanged.
    pub payload: serde_json::Value,
    pub elapsed_ms: u64,
    /// Similarity score when the capability was chosen by the smart router.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relevance: Option<f32>,
}

/// A failed call, with a stable kind.
#[derive(Debug, Clone, Serialize)]
pub struct CallFailure {
    pub call_id: Uuid,
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Every dispatch outcome in one shape.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResultEnvelope {
    Success(CallOutcome),
    Failure(CallFailure),
}

impl ResultEnvelope {
    pub fn from_result(call_id: Uuid, result: Result<CallOutcome, DispatchError>) -> Self {
        match result {
            Ok(outcome) => ResultEnvelope::Success(outcome),
            Err(e) => ResultEnvelope::Failure(CallFailure {
                call_id,
                kind: e.kind(),
                message: e.to_string(),
                data: e.data(),
            }),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ResultEnvelope::Success(_))
    }

    /// Failure kind, if the call failed.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            ResultEnvelope::Success(_) => None,
            ResultEnvelope::Failure(failure) => Some(failure.kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_parse_and_display() {
        for text in ["global", "smart", "server:fs", "group:dev"] {
            let scope: Scope = text.parse().unwrap();
            assert_eq!(scope.to_string(), text);
        }
        assert_eq!("server:fs".parse::<Scope>().unwrap(), Scope::Server("fs".into()));
        assert!("server:".parse::<Scope>().is_err());
        assert!("cluster:x".parse::<Scope>().is_err());
    }

    #[test]
    fn test_request_deserializes_with_defaults() {
        let request: CallRequest = serde_json::from_value(serde_json::json!({
            "scope": { "type": "server", "name": "fs" },
            "name": "read_file",
            "deadline": 1500,
        }))
        .unwrap();
        assert_eq!(request.kind, CapabilityKind::Tool);
        assert_eq!(request.deadline, Some(Duration::from_millis(1500)));
        assert!(request.arguments.is_null());
    }

    #[test]
    fn test_failure_envelope_shape() {
        let id = Uuid::new_v4();
        let envelope = ResultEnvelope::from_result(
            id,
            Err(DispatchError::Disabled {
                key: "fs__write".into(),
            }),
        );
        assert_eq!(envelope.error_kind(), Some(ErrorKind::Disabled));
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["status"], "failure");
        assert_eq!(json["kind"], "disabled");
        assert_eq!(json["call_id"], id.to_string());
    }
}
