//! One upstream server connection: handshake, discovery, calls, and health.
//!
//! An `UpstreamConnection` owns at most one live transport at a time. The
//! supervisor drives it through the state machine:
//!
//! ```text
//! Pending → Connecting → Connected ⇄ Degraded → Disconnected → Connecting …
//!                  └──────────────→ Error (retry budget exhausted)
//! ```
//!
//! Calls and probes feed consecutive-failure and consecutive-timeout counters
//! that move the connection between `Connected`, `Degraded`, and
//! `Disconnected`. Reaching `Disconnected` from traffic fires the `lost`
//! signal so the supervisor tears the channel down and reconnects.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Notify};

use super::errors::UpstreamError;
use super::transport::{extract_result, Connector, Transport};
use super::types::{
    methods, DiscoveredCapabilities, InitializeResult, PromptDefinition, ResourceDefinition,
    ServerNotification, ToolDefinition, TransportKind, UpstreamServerSpec, PROTOCOL_VERSION,
};

/// Upper bound on pages fetched for one list, in case a server loops its cursor.
const MAX_LIST_PAGES: usize = 1_000;

// ─── State ───────────────────────────────────────────────────────────────────

/// Lifecycle state of an upstream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Pending,
    Connecting,
    Connected,
    Degraded,
    Disconnected,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Pending => "pending",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Degraded => "degraded",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Error => "error",
        }
    }

    /// Whether calls may be routed to a connection in this state.
    pub fn is_live(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Degraded)
    }

    /// Whether the first connection attempt has produced an outcome.
    pub fn is_settled(&self) -> bool {
        !matches!(self, ConnectionState::Pending | ConnectionState::Connecting)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Thresholds for the health counters.
#[derive(Debug, Clone, Copy)]
pub struct HealthThresholds {
    /// Consecutive call timeouts that move `Connected` to `Degraded`.
    pub degraded_after_timeouts: u32,
    /// Consecutive probe or channel failures that move to `Disconnected`.
    pub disconnect_after_failures: u32,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            degraded_after_timeouts: 3,
            disconnect_after_failures: 3,
        }
    }
}

/// Snapshot of one server's connection, for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub name: String,
    pub transport: TransportKind,
    pub enabled: bool,
    pub owner: String,
    pub state: ConnectionState,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub connected_since: Option<DateTime<Utc>>,
    pub tool_count: usize,
    pub prompt_count: usize,
    pub resource_count: usize,
    pub server_version: Option<String>,
    pub instructions: Option<String>,
}

#[derive(Debug)]
struct Status {
    state: ConnectionState,
    retry_count: u32,
    last_error: Option<String>,
    connected_since: Option<DateTime<Utc>>,
    counts: (usize, usize, usize),
    consecutive_failures: u32,
    consecutive_timeouts: u32,
}

#[derive(Clone)]
struct Session {
    transport: Arc<dyn Transport>,
    init: InitializeResult,
}

/// Output of a successful [`UpstreamConnection::establish`].
pub struct Established {
    pub capabilities: DiscoveredCapabilities,
    pub notifications: mpsc::UnboundedReceiver<ServerNotification>,
}

// ─── Connection ──────────────────────────────────────────────────────────────

/// A supervised connection to one upstream server.
pub struct UpstreamConnection {
    spec: UpstreamServerSpec,
    thresholds: HealthThresholds,
    status: Mutex<Status>,
    session: Mutex<Option<Session>>,
    state_tx: watch::Sender<ConnectionState>,
    lost: Notify,
}

impl UpstreamConnection {
    pub fn new(spec: UpstreamServerSpec, thresholds: HealthThresholds) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Pending);
        Self {
            spec,
            thresholds,
            status: Mutex::new(Status {
                state: ConnectionState::Pending,
                retry_count: 0,
                last_error: None,
                connected_since: None,
                counts: (0, 0, 0),
                consecutive_failures: 0,
                consecutive_timeouts: 0,
            }),
            session: Mutex::new(None),
            state_tx,
            lost: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &UpstreamServerSpec {
        &self.spec
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Resolves once traffic has pushed the connection to `Disconnected`.
    pub async fn lost(&self) {
        self.lost.notified().await
    }

    /// Consecutive failed connection attempts since the last success.
    pub fn retry_count(&self) -> u32 {
        self.with_status(|s| s.retry_count).unwrap_or(0)
    }

    fn with_status<T>(&self, f: impl FnOnce(&mut Status) -> T) -> Option<T> {
        self.status.lock().ok().map(|mut status| f(&mut status))
    }

    fn transition(&self, status: &mut Status, next: ConnectionState) {
        if status.state == next {
            return;
        }
        tracing::info!(
            server = %self.spec.name,
            from = %status.state,
            to = %next,
            "connection state changed"
        );
        status.state = next;
        self.state_tx.send_replace(next);
    }

    fn set_state(&self, next: ConnectionState) {
        self.with_status(|s| self.transition(s, next));
    }

    fn current_session(&self) -> Option<Session> {
        self.session.lock().ok().and_then(|s| s.clone())
    }

    // ─── Establishment ───────────────────────────────────────────────────────

    /// Open a transport, run the handshake, and discover capabilities.
    ///
    /// On failure the transport is closed again and nothing is installed,
    /// so a partially discovered server never becomes visible.
    pub async fn establish(&self, connector: &dyn Connector) -> Result<Established, UpstreamError> {
        self.set_state(ConnectionState::Connecting);
        tracing::debug!(server = %self.spec.name, transport = %self.spec.transport, "opening transport");

        let opened = connector.open(&self.spec).await?;
        let transport = opened.transport;

        let outcome = async {
            let init = handshake(transport.as_ref(), &self.spec.name).await?;
            let capabilities = discover(transport.as_ref(), &init).await?;
            Ok::<_, UpstreamError>((init, capabilities))
        }
        .await;

        match outcome {
            Ok((init, capabilities)) => {
                if let Ok(mut session) = self.session.lock() {
                    *session = Some(Session {
                        transport,
                        init,
                    });
                }
                Ok(Established {
                    capabilities,
                    notifications: opened.notifications,
                })
            }
            Err(e) => {
                let diagnostics = transport.diagnostics();
                transport.close().await;
                if let Some(stderr) = &diagnostics {
                    tracing::warn!(server = %self.spec.name, stderr = %stderr, "server stderr captured on failure");
                }
                Err(match e {
                    UpstreamError::InitFailed { .. } => e,
                    other => UpstreamError::InitFailed {
                        name: self.spec.name.clone(),
                        reason: format!("{other}{}", stderr_suffix(diagnostics.as_deref())),
                    },
                })
            }
        }
    }

    /// Re-run discovery on the live session (after a list-changed notification).
    ///
    /// Bounded by `timeout`; a server that stalls its lists fails the
    /// re-discovery instead of holding up health checks.
    pub async fn rediscover(&self, timeout: Duration) -> Result<DiscoveredCapabilities, UpstreamError> {
        let session = self.current_session().ok_or_else(|| self.not_connected())?;
        let capabilities = tokio::time::timeout(timeout, discover(session.transport.as_ref(), &session.init))
            .await
            .map_err(|_| UpstreamError::Timeout {
                server: self.spec.name.clone(),
                method: "capability discovery".into(),
                timeout_ms: timeout.as_millis() as u64,
            })??;
        self.with_status(|s| {
            s.counts = (
                capabilities.tools.len(),
                capabilities.prompts.len(),
                capabilities.resources.len(),
            )
        });
        Ok(capabilities)
    }

    /// Record a successful establishment. Resets the retry counter.
    pub fn mark_connected(&self, capabilities: &DiscoveredCapabilities) {
        self.with_status(|s| {
            s.retry_count = 0;
            s.last_error = None;
            s.connected_since = Some(Utc::now());
            s.consecutive_failures = 0;
            s.consecutive_timeouts = 0;
            s.counts = (
                capabilities.tools.len(),
                capabilities.prompts.len(),
                capabilities.resources.len(),
            );
            self.transition(s, ConnectionState::Connected);
        });
    }

    /// Record a failed attempt; the supervisor will retry after backoff.
    pub fn mark_retrying(&self, attempt: u32, error: &UpstreamError) {
        self.with_status(|s| {
            s.retry_count = attempt;
            s.last_error = Some(error.to_string());
            s.connected_since = None;
            self.transition(s, ConnectionState::Disconnected);
        });
    }

    /// Record that the channel dropped while connected.
    pub fn mark_disconnected(&self, reason: &str) {
        self.with_status(|s| {
            s.last_error = Some(reason.to_string());
            s.connected_since = None;
            self.transition(s, ConnectionState::Disconnected);
        });
    }

    /// Record that retries are exhausted after `attempts` failures.
    pub fn mark_error(&self, attempts: u32, error: &UpstreamError) {
        self.with_status(|s| {
            s.retry_count = attempts;
            s.last_error = Some(error.to_string());
            s.connected_since = None;
            self.transition(s, ConnectionState::Error);
        });
    }

    /// Close and forget the live transport, if any.
    pub async fn teardown(&self) {
        let session = self.session.lock().ok().and_then(|mut s| s.take());
        if let Some(session) = session {
            session.transport.close().await;
        }
    }

    // ─── Traffic ─────────────────────────────────────────────────────────────

    /// Send a request with a deadline and feed the outcome into the health
    /// counters. Application errors come back as `ServerError` and count as a
    /// healthy round trip.
    pub async fn call(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value, UpstreamError> {
        let session = match self.current_session() {
            Some(session) if self.state().is_live() => session,
            _ => return Err(self.not_connected()),
        };

        match tokio::time::timeout(timeout, session.transport.request(method, params)).await {
            Err(_) => {
                self.record_timeout();
                Err(UpstreamError::Timeout {
                    server: self.spec.name.clone(),
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
            Ok(Err(e)) => {
                if e.is_channel_failure() || session.transport.is_closed() {
                    self.record_failure(&e.to_string());
                }
                Err(e)
            }
            Ok(Ok(response)) => {
                self.record_success();
                extract_result(response)
            }
        }
    }

    /// Liveness probe. Any failure, including a timeout, counts toward
    /// disconnection.
    pub async fn probe(&self, timeout: Duration) -> Result<(), UpstreamError> {
        let session = self.current_session().ok_or_else(|| self.not_connected())?;
        let result = match tokio::time::timeout(timeout, session.transport.request(methods::PING, None)).await {
            Err(_) => Err(UpstreamError::Timeout {
                server: self.spec.name.clone(),
                method: methods::PING.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
            Ok(Err(e)) => Err(e),
            // Servers that predate `ping` answer with an error, which still
            // proves the channel is alive.
            Ok(Ok(_)) => Ok(()),
        };
        match &result {
            Ok(()) => self.record_success(),
            Err(e) => {
                tracing::debug!(server = %self.spec.name, error = %e, "probe failed");
                self.record_failure(&e.to_string());
            }
        }
        result
    }

    fn record_success(&self) {
        self.with_status(|s| {
            s.consecutive_failures = 0;
            s.consecutive_timeouts = 0;
            if s.state == ConnectionState::Degraded {
                self.transition(s, ConnectionState::Connected);
            }
        });
    }

    fn record_timeout(&self) {
        self.with_status(|s| {
            s.consecutive_timeouts += 1;
            if s.state == ConnectionState::Connected
                && s.consecutive_timeouts >= self.thresholds.degraded_after_timeouts
            {
                tracing::warn!(
                    server = %self.spec.name,
                    timeouts = s.consecutive_timeouts,
                    "repeated call timeouts"
                );
                self.transition(s, ConnectionState::Degraded);
            }
        });
    }

    fn record_failure(&self, reason: &str) {
        let lost = self
            .with_status(|s| {
                if !s.state.is_live() {
                    return false;
                }
                s.consecutive_failures += 1;
                s.last_error = Some(reason.to_string());
                if s.consecutive_failures >= self.thresholds.disconnect_after_failures {
                    s.connected_since = None;
                    self.transition(s, ConnectionState::Disconnected);
                    true
                } else {
                    self.transition(s, ConnectionState::Degraded);
                    false
                }
            })
            .unwrap_or(false);
        if lost {
            self.lost.notify_one();
        }
    }

    fn not_connected(&self) -> UpstreamError {
        UpstreamError::NotConnected {
            name: self.spec.name.clone(),
            state: self.state().to_string(),
        }
    }

    // ─── Reporting ───────────────────────────────────────────────────────────

    pub fn status(&self) -> ServerStatus {
        let session = self.current_session();
        let (state, retry_count, last_error, connected_since, counts) = self
            .with_status(|s| {
                (
                    s.state,
                    s.retry_count,
                    s.last_error.clone(),
                    s.connected_since,
                    s.counts,
                )
            })
            .unwrap_or((ConnectionState::Error, 0, None, None, (0, 0, 0)));

        ServerStatus {
            name: self.spec.name.clone(),
            transport: self.spec.transport,
            enabled: self.spec.enabled,
            owner: self.spec.owner.clone(),
            state,
            retry_count,
            last_error,
            connected_since,
            tool_count: counts.0,
            prompt_count: counts.1,
            resource_count: counts.2,
            server_version: session
                .as_ref()
                .and_then(|s| s.init.server_info.as_ref())
                .and_then(|info| info.version.clone()),
            instructions: session.and_then(|s| s.init.instructions),
        }
    }

    /// Wait until the current attempt has an outcome, or `timeout` passes.
    pub async fn wait_settled(&self, timeout: Duration) -> ConnectionState {
        let mut rx = self.subscribe_state();
        let settled = async {
            loop {
                let state = *rx.borrow_and_update();
                if state.is_settled() {
                    return state;
                }
                if rx.changed().await.is_err() {
                    return state;
                }
            }
        };
        tokio::time::timeout(timeout, settled)
            .await
            .unwrap_or_else(|_| self.state())
    }
}

// ─── Protocol ────────────────────────────────────────────────────────────────

/// Perform the MCP initialization handshake.
async fn handshake(transport: &dyn Transport, server_name: &str) -> Result<InitializeResult, UpstreamError> {
    let params = serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": "toolhub",
            "version": env!("CARGO_PKG_VERSION"),
        },
    });
    let response = transport.request(methods::INITIALIZE, Some(params)).await?;
    let result = extract_result(response)?;

    let init: InitializeResult =
        serde_json::from_value(result).map_err(|e| UpstreamError::InitFailed {
            name: server_name.to_string(),
            reason: format!("failed to parse initialize response: {e}"),
        })?;

    transport.notify(methods::INITIALIZED, None).await?;
    transport.on_initialized().await;

    tracing::debug!(
        server = server_name,
        protocol = init.protocol_version.as_deref().unwrap_or("unknown"),
        "handshake complete"
    );
    Ok(init)
}

/// Fetch every advertised capability list. Any failing list fails the whole
/// discovery.
async fn discover(
    transport: &dyn Transport,
    init: &InitializeResult,
) -> Result<DiscoveredCapabilities, UpstreamError> {
    let mut caps = DiscoveredCapabilities::default();
    if init.advertises("tools") {
        caps.tools = list_all::<ToolDefinition>(transport, methods::TOOLS_LIST, "tools").await?;
    }
    if init.advertises("prompts") {
        caps.prompts = list_all::<PromptDefinition>(transport, methods::PROMPTS_LIST, "prompts").await?;
    }
    if init.advertises("resources") {
        caps.resources =
            list_all::<ResourceDefinition>(transport, methods::RESOURCES_LIST, "resources").await?;
    }
    tracing::debug!(
        server = transport.server_name(),
        tools = caps.tools.len(),
        prompts = caps.prompts.len(),
        resources = caps.resources.len(),
        "discovery complete"
    );
    Ok(caps)
}

/// Follow `nextCursor` until the list is exhausted.
async fn list_all<T: serde::de::DeserializeOwned>(
    transport: &dyn Transport,
    method: &str,
    field: &str,
) -> Result<Vec<T>, UpstreamError> {
    let mut items = Vec::new();
    let mut cursor: Option<String> = None;

    for _ in 0..MAX_LIST_PAGES {
        let params = cursor.as_ref().map(|c| serde_json::json!({ "cursor": c }));
        let result = extract_result(transport.request(method, params).await?)?;

        let page = result
            .get(field)
            .cloned()
            .unwrap_or_else(|| serde_json::Value::Array(Vec::new()));
        let mut parsed: Vec<T> =
            serde_json::from_value(page).map_err(|e| UpstreamError::ProtocolError {
                server: transport.server_name().to_string(),
                reason: format!("malformed {method} result: {e}"),
            })?;
        items.append(&mut parsed);

        let next = result
            .get("nextCursor")
            .and_then(|c| c.as_str())
            .filter(|c| !c.is_empty())
            .map(String::from);
        match next {
            Some(next) if cursor.as_deref() != Some(next.as_str()) => cursor = Some(next),
            _ => return Ok(items),
        }
    }

    Err(UpstreamError::ProtocolError {
        server: transport.server_name().to_string(),
        reason: format!("{method} exceeded {MAX_LIST_PAGES} pages"),
    })
}

fn stderr_suffix(stderr: Option<&str>) -> String {
    match stderr {
        Some(s) if !s.trim().is_empty() => format!(" | stderr: {}", s.trim()),
        _ => String::new(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
