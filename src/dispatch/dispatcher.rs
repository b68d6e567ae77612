//! Request dispatcher.
//!
//! Resolves a [`CallRequest`] to one capability on one live connection,
//! forwards it with a deadline, and normalizes the outcome.
//!
//! Resolution per scope:
//! - server: exact lookup on that server
//! - group: members in declaration order; the first listed server offering
//!   the name wins, preferring a healthy server over a degraded one
//! - global: a namespaced key is looked up directly; a bare name is searched
//!   across servers in name order
//! - smart: the single top-ranked match from the smart router, never a fan-out

use std::sync::Arc;
use std::time::{Duration, Instant};

use uuid::Uuid;

use super::errors::DispatchError;
use super::types::{CallOutcome, CallRequest, ResultEnvelope, Scope};
use crate::config::DispatchSettings;
use crate::registry::{CapabilityKind, CapabilityRegistry, CapabilityView, NamespacedKey};
use crate::smart::SmartRouter;
use crate::upstream::connection::{ConnectionState, UpstreamConnection};
use crate::upstream::types::methods;
use crate::upstream::Supervisor;

/// A capability chosen for a call.
struct Resolved {
    view: CapabilityView,
    connection: Arc<UpstreamConnection>,
    relevance: Option<f32>,
}

/// Routes calls to upstream connections.
pub struct Dispatcher {
    registry: Arc<CapabilityRegistry>,
    supervisor: Arc<Supervisor>,
    router: Arc<SmartRouter>,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        supervisor: Arc<Supervisor>,
        router: Arc<SmartRouter>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            registry,
            supervisor,
            router,
            settings,
        }
    }

    /// Dispatch a call and wrap the outcome in a [`ResultEnvelope`].
    pub async fn dispatch_envelope(&self, request: CallRequest) -> ResultEnvelope {
        let call_id = Uuid::new_v4();
        let result = self.dispatch_with_id(call_id, request).await;
        ResultEnvelope::from_result(call_id, result)
    }

    /// Resolve and invoke one capability.
    pub async fn dispatch(&self, request: CallRequest) -> Result<CallOutcome, DispatchError> {
        self.dispatch_with_id(Uuid::new_v4(), request).await
    }

    async fn dispatch_with_id(
        &self,
        call_id: Uuid,
        request: CallRequest,
    ) -> Result<CallOutcome, DispatchError> {
        let start = Instant::now();
        let scope = request.scope.to_string();

        let result = async {
            let resolved = self.resolve(&request).await?;
            self.invoke(call_id, &request, resolved, start).await
        }
        .await;

        match &result {
            Ok(outcome) => tracing::info!(
                call_id = %call_id,
                scope = %scope,
                key = %outcome.key,
                elapsed_ms = outcome.elapsed_ms,
                "call dispatched"
            ),
            Err(e) => tracing::warn!(
                call_id = %call_id,
                scope = %scope,
                name = %request.name,
                kind = %e.kind(),
                error = %e,
                "call failed"
            ),
        }
        result
    }

    // ─── Resolution ──────────────────────────────────────────────────────────

    async fn resolve(&self, request: &CallRequest) -> Result<Resolved, DispatchError> {
        match &request.scope {
            Scope::Server(server) => self.resolve_server(server, request.kind, &request.name),
            Scope::Group(group) => self.resolve_group(group, request.kind, &request.name),
            Scope::Global => self.resolve_global(request.kind, &request.name),
            Scope::Smart => self.resolve_smart(&request.name).await,
        }
    }

    fn resolve_server(&self, server: &str, kind: CapabilityKind, name: &str) -> Result<Resolved, DispatchError> {
        let local = NamespacedKey::parse(kind, name)
            .filter(|key| key.server == server)
            .map(|key| key.local)
            .unwrap_or_else(|| name.to_string());
        let view = self
            .registry
            .find(server, kind, &local)
            .ok_or_else(|| not_found(format!("{kind} '{local}' on server '{server}'")))?;
        self.usable(view, None)
    }

    fn resolve_group(&self, group: &str, kind: CapabilityKind, name: &str) -> Result<Resolved, DispatchError> {
        let members = self
            .registry
            .list_by_group(group)
            .map_err(|e| not_found(e.to_string()))?;

        let candidates: Vec<CapabilityView> = members
            .into_iter()
            .filter(|v| v.kind == kind && (v.local_name == name || v.key.to_string() == name))
            .collect();
        if candidates.is_empty() {
            return Err(not_found(format!("{kind} '{name}' in group '{group}'")));
        }

        let mut enabled = candidates.iter().filter(|v| v.enabled).peekable();
        if enabled.peek().is_none() {
            return Err(DispatchError::Disabled {
                key: candidates[0].key.to_string(),
            });
        }

        let mut fallback: Option<Resolved> = None;
        for view in enabled {
            let Some(connection) = self.supervisor.connection(&view.server) else {
                continue;
            };
            match connection.state() {
                ConnectionState::Connected => {
                    return Ok(Resolved {
                        view: view.clone(),
                        connection,
                        relevance: None,
                    })
                }
                ConnectionState::Degraded if fallback.is_none() => {
                    fallback = Some(Resolved {
                        view: view.clone(),
                        connection,
                        relevance: None,
                    });
                }
                _ => {}
            }
        }
        fallback.ok_or_else(|| DispatchError::Connect {
            server: candidates[0].server.clone(),
            reason: format!("no live server in group '{group}' offers '{name}'"),
        })
    }

    fn resolve_global(&self, kind: CapabilityKind, name: &str) -> Result<Resolved, DispatchError> {
        if let Some(view) = NamespacedKey::parse(kind, name).and_then(|key| self.registry.get(&key)) {
            return self.usable(view, None);
        }

        let matches: Vec<CapabilityView> = self
            .registry
            .server_names()
            .iter()
            .filter_map(|server| self.registry.find(server, kind, name))
            .collect();
        match matches.iter().find(|v| v.enabled) {
            Some(view) => self.usable(view.clone(), None),
            None => match matches.into_iter().next() {
                Some(view) => Err(DispatchError::Disabled {
                    key: view.key.to_string(),
                }),
                None => Err(not_found(format!("{kind} '{name}'"))),
            },
        }
    }

    async fn resolve_smart(&self, intent: &str) -> Result<Resolved, DispatchError> {
        let best = self
            .router
            .best_match(intent)
            .await
            .map_err(|e| DispatchError::RoutingUnavailable { reason: e.to_string() })?
            .ok_or_else(|| not_found(format!("no confident match for intent '{intent}'")))?;

        let view = self
            .registry
            .get(&best.key)
            .ok_or_else(|| not_found(format!("capability '{}'", best.key)))?;
        tracing::debug!(intent, key = %best.key, score = best.score, "smart route");
        self.usable(view, Some(best.score))
    }

    /// Check a resolved capability is enabled and its server is live.
    fn usable(&self, view: CapabilityView, relevance: Option<f32>) -> Result<Resolved, DispatchError> {
        if !view.enabled {
            return Err(DispatchError::Disabled {
                key: view.key.to_string(),
            });
        }
        let connection = self
            .supervisor
            .connection(&view.server)
            .ok_or_else(|| DispatchError::Connect {
                server: view.server.clone(),
                reason: "server is not running".into(),
            })?;
        Ok(Resolved {
            view,
            connection,
            relevance,
        })
    }

    // ─── Invocation ──────────────────────────────────────────────────────────

    async fn invoke(
        &self,
        call_id: Uuid,
        request: &CallRequest,
        resolved: Resolved,
        start: Instant,
    ) -> Result<CallOutcome, DispatchError> {
        let Resolved {
            view,
            connection,
            relevance,
        } = resolved;
        let server = view.server.clone();
        let timeout = self.deadline_for(request.deadline, connection.state());

        let arguments = if request.arguments.is_null() {
            serde_json::json!({})
        } else {
            request.arguments.clone()
        };
        let (method, params) = match view.kind {
            CapabilityKind::Tool => (
                methods::TOOLS_CALL,
                serde_json::json!({ "name": view.local_name, "arguments": arguments }),
            ),
            CapabilityKind::Prompt => (
                methods::PROMPTS_GET,
                serde_json::json!({ "name": view.local_name, "arguments": arguments }),
            ),
            CapabilityKind::Resource => (
                methods::RESOURCES_READ,
                serde_json::json!({ "uri": view.local_name }),
            ),
        };

        tracing::debug!(call_id = %call_id, key = %view.key, method, timeout_ms = timeout.as_millis() as u64, "forwarding call");
        let payload = connection
            .call(method, Some(params), timeout)
            .await
            .map_err(|e| DispatchError::from_upstream(&server, e))?;

        if view.kind == CapabilityKind::Tool && payload.get("isError").and_then(|v| v.as_bool()) == Some(true) {
            return Err(DispatchError::Application {
                server,
                code: None,
                message: first_text(&payload).unwrap_or_else(|| "tool reported an error".into()),
                data: Some(payload),
            });
        }

        Ok(CallOutcome {
            call_id,
            key: view.key,
            server,
            payload,
            elapsed_ms: start.elapsed().as_millis() as u64,
            relevance,
        })
    }

    /// Per-call deadline: the caller's, else the default; capped lower for
    /// degraded connections.
    fn deadline_for(&self, requested: Option<Duration>, state: ConnectionState) -> Duration {
        let timeout = requested.unwrap_or_else(|| self.settings.call_timeout());
        if state == ConnectionState::Degraded {
            timeout.min(self.settings.degraded_call_timeout())
        } else {
            timeout
        }
    }
}

fn not_found(what: String) -> DispatchError {
    DispatchError::NotFound { what }
}

/// First text block of a tool result's `content`.
fn first_text(payload: &serde_json::Value) -> Option<String> {
    payload
        .get("content")?
        .as_array()?
        .iter()
        .find_map(|block| block.get("text").and_then(|t| t.as_str()))
        .map(String::from)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
