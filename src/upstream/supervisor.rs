//! Connection supervisor.
//!
//! Owns every [`UpstreamConnection`] and runs one task per enabled server.
//! Each task connects (behind a shared concurrency gate), publishes the
//! discovered capabilities, watches the connection, and reconnects with
//! backoff when it drops. Tasks share nothing but the gate and the registry,
//! so one server hanging or crashing never holds up another.
//!
//! Only the supervisor publishes or withdraws a server's registry section,
//! and always as a whole.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use tokio::sync::{mpsc, watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval};

use super::connection::{ConnectionState, ServerStatus, UpstreamConnection};
use super::errors::UpstreamError;
use super::transport::Connector;
use super::types::{ServerNotification, UpstreamServerSpec};
use crate::config::{ConfigChange, SupervisorSettings};
use crate::registry::CapabilityRegistry;

/// Reported as `last_error` for servers switched off in the configuration.
const DISABLED_REASON: &str = "server disabled";

// ─── Managed Entries ─────────────────────────────────────────────────────────

struct ManagedEntry {
    connection: Arc<UpstreamConnection>,
    stop: watch::Sender<bool>,
    rearm: Arc<Notify>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
    running: HashMap<String, ManagedEntry>,
    /// Specs kept for status reporting while `enabled` is false.
    disabled: HashMap<String, UpstreamServerSpec>,
}

/// Supervises every upstream connection.
pub struct Supervisor {
    registry: Arc<CapabilityRegistry>,
    connector: Arc<dyn Connector>,
    settings: SupervisorSettings,
    gate: Arc<Semaphore>,
    inner: tokio::sync::Mutex<Inner>,
    connections: DashMap<String, Arc<UpstreamConnection>>,
}

impl Supervisor {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        connector: Arc<dyn Connector>,
        settings: SupervisorSettings,
    ) -> Self {
        let gate = Arc::new(Semaphore::new(settings.max_concurrent_starts.max(1)));
        Self {
            registry,
            connector,
            settings,
            gate,
            inner: tokio::sync::Mutex::new(Inner::default()),
            connections: DashMap::new(),
        }
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────────

    /// Start every spec and wait until each enabled one has a first outcome.
    ///
    /// A failing server never fails the whole start; its status says why.
    pub async fn start_all(&self, specs: Vec<UpstreamServerSpec>) -> Vec<ServerStatus> {
        let enabled = specs.iter().filter(|s| s.enabled).count();
        for spec in specs {
            self.upsert(spec).await;
        }

        let waves = enabled.div_ceil(self.settings.max_concurrent_starts.max(1)) as u32;
        let patience = self.settings.init_timeout() * waves.max(1) + Duration::from_secs(1);
        let connections: Vec<_> = self.connections.iter().map(|c| Arc::clone(c.value())).collect();
        futures::future::join_all(connections.iter().map(|c| c.wait_settled(patience))).await;

        let statuses = self.statuses().await;
        let connected = statuses.iter().filter(|s| s.state.is_live()).count();
        tracing::info!(servers = statuses.len(), connected, "supervisor started");
        statuses
    }

    /// Add a server or replace its definition.
    ///
    /// Any existing task for the name is stopped and its transport closed
    /// before the new one starts, so a server never has two live channels.
    /// Upserting always re-arms retries, even after the attempt ceiling.
    pub async fn upsert(&self, spec: UpstreamServerSpec) {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.running.remove(&spec.name) {
            self.stop_entry(&spec.name, entry).await;
        }
        inner.disabled.remove(&spec.name);

        if !spec.enabled {
            tracing::info!(server = %spec.name, "server disabled");
            self.registry.withdraw_server(&spec.name);
            inner.disabled.insert(spec.name.clone(), spec);
            return;
        }

        let name = spec.name.clone();
        let entry = self.launch(spec);
        inner.running.insert(name, entry);
    }

    /// Stop and forget a server. Returns whether it was known.
    pub async fn remove(&self, name: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let was_disabled = inner.disabled.remove(name).is_some();
        let known = match inner.running.remove(name) {
            Some(entry) => {
                self.stop_entry(name, entry).await;
                true
            }
            None => was_disabled,
        };
        if known {
            self.registry.forget_server(name);
            tracing::info!(server = name, "server removed");
        }
        known
    }

    /// Switch a server on or off. Switching on always re-arms retries.
    pub async fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), UpstreamError> {
        let spec = {
            let inner = self.inner.lock().await;
            if let Some(entry) = inner.running.get(name) {
                if enabled {
                    if !entry.connection.state().is_live() {
                        entry.rearm.notify_one();
                    }
                    return Ok(());
                }
                entry.connection.spec().clone()
            } else if let Some(spec) = inner.disabled.get(name) {
                if !enabled {
                    return Ok(());
                }
                spec.clone()
            } else {
                return Err(UpstreamError::UnknownServer {
                    name: name.to_string(),
                });
            }
        };
        self.upsert(UpstreamServerSpec { enabled, ..spec }).await;
        Ok(())
    }

    /// Apply one configuration change.
    pub async fn apply(&self, change: ConfigChange) -> Result<(), UpstreamError> {
        match change {
            ConfigChange::UpsertServer { spec } => {
                self.upsert(spec).await;
                Ok(())
            }
            ConfigChange::RemoveServer { name } => {
                if self.remove(&name).await {
                    Ok(())
                } else {
                    Err(UpstreamError::UnknownServer { name })
                }
            }
            ConfigChange::SetServerEnabled { name, enabled } => self.set_enabled(&name, enabled).await,
            ConfigChange::ReplaceGroups { groups } => {
                tracing::info!(groups = groups.len(), "groups replaced");
                self.registry.replace_groups(groups);
                Ok(())
            }
        }
    }

    /// Skip the backoff wait of a server that is not connected and reconnect
    /// now. Resets the attempt ceiling. A no-op for live connections.
    pub async fn retry(&self, name: &str) -> Result<(), UpstreamError> {
        let inner = self.inner.lock().await;
        match inner.running.get(name) {
            Some(entry) => {
                let state = entry.connection.state();
                if state.is_live() {
                    tracing::debug!(server = name, state = %state, "retry ignored, connection is live");
                } else {
                    tracing::info!(server = name, state = %state, "manual retry requested");
                    entry.rearm.notify_one();
                }
                Ok(())
            }
            None if inner.disabled.contains_key(name) => Err(UpstreamError::NotConnected {
                name: name.to_string(),
                state: "disabled".into(),
            }),
            None => Err(UpstreamError::UnknownServer {
                name: name.to_string(),
            }),
        }
    }

    /// Stop every task, close every transport, and clear the registry.
    pub async fn shutdown(&self) {
        let entries: Vec<(String, ManagedEntry)> = {
            let mut inner = self.inner.lock().await;
            inner.disabled.clear();
            inner.running.drain().collect()
        };
        for (_, entry) in &entries {
            let _ = entry.stop.send(true);
        }
        let count = entries.len();
        futures::future::join_all(
            entries
                .into_iter()
                .map(|(name, entry)| async move { self.stop_entry(&name, entry).await }),
        )
        .await;
        self.registry.clear();
        tracing::info!(servers = count, "supervisor shut down");
    }

    fn launch(&self, spec: UpstreamServerSpec) -> ManagedEntry {
        let name = spec.name.clone();
        let connection = Arc::new(UpstreamConnection::new(spec, self.settings.health()));
        let (stop, stop_rx) = watch::channel(false);
        let rearm = Arc::new(Notify::new());

        let worker = Worker {
            connection: Arc::clone(&connection),
            connector: Arc::clone(&self.connector),
            registry: Arc::clone(&self.registry),
            settings: self.settings.clone(),
            gate: Arc::clone(&self.gate),
            rearm: Arc::clone(&rearm),
        };
        let task = tokio::spawn(worker.run(stop_rx));
        self.connections.insert(name, Arc::clone(&connection));

        ManagedEntry {
            connection,
            stop,
            rearm,
            task,
        }
    }

    async fn stop_entry(&self, name: &str, entry: ManagedEntry) {
        self.connections.remove(name);
        let _ = entry.stop.send(true);
        if let Err(e) = entry.task.await {
            tracing::error!(server = name, error = %e, "connection task panicked");
            entry.connection.teardown().await;
        }
        self.registry.withdraw_server(name);
    }

    // ─── Reads ───────────────────────────────────────────────────────────────

    /// The live connection object for a server, if it is enabled.
    pub fn connection(&self, name: &str) -> Option<Arc<UpstreamConnection>> {
        self.connections.get(name).map(|c| Arc::clone(c.value()))
    }

    pub async fn status(&self, name: &str) -> Option<ServerStatus> {
        let inner = self.inner.lock().await;
        if let Some(entry) = inner.running.get(name) {
            return Some(entry.connection.status());
        }
        inner.disabled.get(name).map(disabled_status)
    }

    /// Status of every known server, ordered by name.
    pub async fn statuses(&self) -> Vec<ServerStatus> {
        let inner = self.inner.lock().await;
        let mut statuses: Vec<ServerStatus> = inner
            .running
            .values()
            .map(|e| e.connection.status())
            .chain(inner.disabled.values().map(disabled_status))
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }
}

fn disabled_status(spec: &UpstreamServerSpec) -> ServerStatus {
    ServerStatus {
        name: spec.name.clone(),
        transport: spec.transport,
        enabled: false,
        owner: spec.owner.clone(),
        state: ConnectionState::Error,
        retry_count: 0,
        last_error: Some(DISABLED_REASON.to_string()),
        connected_since: None,
        tool_count: 0,
        prompt_count: 0,
        resource_count: 0,
        server_version: None,
        instructions: None,
    }
}

// ─── Connection Task ─────────────────────────────────────────────────────────

/// How a backoff wait ended.
#[derive(Debug, PartialEq, Eq)]
enum Pause {
    Elapsed,
    /// A retry or re-enable cut the wait short; the attempt budget starts over.
    Rearmed,
    Stopped,
}

/// Why the monitor loop of a connected server ended.
enum MonitorExit {
    Stopped,
    Lost(String),
}

/// Everything one connection task needs; nothing is shared with other tasks
/// except the gate and the registry.
struct Worker {
    connection: Arc<UpstreamConnection>,
    connector: Arc<dyn Connector>,
    registry: Arc<CapabilityRegistry>,
    settings: SupervisorSettings,
    gate: Arc<Semaphore>,
    rearm: Arc<Notify>,
}

impl Worker {
    fn name(&self) -> &str {
        self.connection.name()
    }

    async fn run(self, mut stop: watch::Receiver<bool>) {
        let backoff = self.settings.backoff.clone();
        let mut failures: u32 = 0;

        loop {
            let permit = tokio::select! {
                permit = Arc::clone(&self.gate).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = stopped(&mut stop) => break,
            };

            let attempt = tokio::select! {
                result = tokio::time::timeout(
                    self.settings.init_timeout(),
                    self.connection.establish(self.connector.as_ref()),
                ) => result,
                _ = stopped(&mut stop) => {
                    self.connection.teardown().await;
                    break;
                }
            };
            drop(permit);

            let outcome = attempt.unwrap_or_else(|_| {
                Err(UpstreamError::InitFailed {
                    name: self.name().to_string(),
                    reason: format!(
                        "initialization timed out after {}ms",
                        self.settings.init_timeout_ms
                    ),
                })
            });

            match outcome {
                Ok(established) => {
                    failures = 0;
                    // A retry requested mid-attempt is satisfied by this connection.
                    let _ = self.rearm.notified().now_or_never();
                    self.connection.mark_connected(&established.capabilities);
                    self.registry.publish_server(
                        self.connection.spec(),
                        self.connection.state(),
                        &established.capabilities,
                    );

                    let exit = self.monitor(established.notifications, &mut stop).await;
                    self.registry.withdraw_server(self.name());
                    self.connection.teardown().await;

                    match exit {
                        MonitorExit::Stopped => break,
                        MonitorExit::Lost(reason) => {
                            tracing::warn!(server = %self.name(), reason = %reason, "connection lost, reconnecting");
                            self.connection.mark_disconnected(&reason);
                            if self.pause(backoff.delay(1), &mut stop).await == Pause::Stopped {
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    failures += 1;
                    if backoff.exhausted(failures) {
                        tracing::error!(
                            server = %self.name(),
                            attempts = failures,
                            error = %e,
                            "giving up on server until it is retried or reconfigured"
                        );
                        self.connection.mark_error(failures, &e);
                        tokio::select! {
                            _ = self.rearm.notified() => failures = 0,
                            _ = stopped(&mut stop) => break,
                        }
                    } else {
                        let delay = backoff.delay(failures);
                        tracing::warn!(
                            server = %self.name(),
                            attempt = failures,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "connection attempt failed, retrying"
                        );
                        self.connection.mark_retrying(failures, &e);
                        match self.pause(delay, &mut stop).await {
                            Pause::Elapsed => {}
                            Pause::Rearmed => {
                                tracing::info!(server = %self.name(), "retry requested, attempt budget reset");
                                failures = 0;
                            }
                            Pause::Stopped => break,
                        }
                    }
                }
            }
        }

        tracing::debug!(server = %self.name(), "connection task stopped");
    }

    /// Sleep before the next attempt. A manual retry cuts the wait short.
    async fn pause(&self, delay: Duration, stop: &mut watch::Receiver<bool>) -> Pause {
        tokio::select! {
            _ = tokio::time::sleep(delay) => Pause::Elapsed,
            _ = self.rearm.notified() => Pause::Rearmed,
            _ = stopped(stop) => Pause::Stopped,
        }
    }

    /// Watch a connected server until it is lost or the task is stopped.
    async fn monitor(
        &self,
        mut notifications: mpsc::UnboundedReceiver<ServerNotification>,
        stop: &mut watch::Receiver<bool>,
    ) -> MonitorExit {
        let mut states = self.connection.subscribe_state();
        let mut probes = self
            .settings
            .probe_interval()
            .map(|every| tokio::time::interval_at(Instant::now() + every, every));

        loop {
            tokio::select! {
                _ = stopped(stop) => return MonitorExit::Stopped,
                _ = self.connection.lost() => {
                    if self.connection.state() == ConnectionState::Disconnected {
                        let reason = self
                            .connection
                            .status()
                            .last_error
                            .unwrap_or_else(|| "health checks failed".into());
                        return MonitorExit::Lost(reason);
                    }
                }
                notification = notifications.recv() => match notification {
                    None => return MonitorExit::Lost("channel closed".into()),
                    Some(n) if n.is_list_changed() => {
                        tokio::select! {
                            _ = self.republish(&n.method) => {}
                            _ = stopped(stop) => return MonitorExit::Stopped,
                        }
                    }
                    Some(n) => {
                        tracing::debug!(server = %self.name(), method = %n.method, "server notification");
                    }
                },
                _ = tick(&mut probes) => {
                    tokio::select! {
                        _ = self.connection.probe(self.settings.probe_timeout()) => {}
                        _ = stopped(stop) => return MonitorExit::Stopped,
                    }
                }
                changed = states.changed() => {
                    if changed.is_ok() {
                        let state = *states.borrow_and_update();
                        self.registry.set_server_state(self.name(), state);
                    }
                }
            }
        }
    }

    /// Re-run discovery after a list-changed notification and swap the new
    /// set in. On failure the last published set stays visible.
    async fn republish(&self, method: &str) {
        tracing::info!(server = %self.name(), notification = method, "capability list changed");
        match self.connection.rediscover(self.settings.init_timeout()).await {
            Ok(capabilities) => {
                self.registry
                    .publish_server(self.connection.spec(), self.connection.state(), &capabilities);
            }
            Err(e) => {
                tracing::warn!(server = %self.name(), error = %e, "re-discovery failed, keeping previous capabilities");
            }
        }
    }
}

/// Resolves once the stop flag is set or its sender is gone.
async fn stopped(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            return;
        }
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
