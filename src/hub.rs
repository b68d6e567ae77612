//! The hub: explicit wiring of supervisor, registry, smart router, and
//! dispatcher, plus the read and toggle surface used by presentation layers.
//!
//! Everything is constructed here and passed down by reference; nothing is a
//! global. Tests build a hub over an in-memory connector and embedder.

use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::{diff, ConfigChange, ConfigError, HubConfig, HubSettings};
use crate::dispatch::{CallOutcome, CallRequest, DispatchError, Dispatcher, ResultEnvelope};
use crate::registry::{
    CapabilityFilter, CapabilityRegistry, CapabilityView, NamespacedKey, RegistryError, Viewer,
};
use crate::smart::{EmbeddingProvider, HttpEmbeddingProvider, SmartError, SmartRouter, SmartStatus};
use crate::upstream::{Connector, DefaultConnector, ServerStatus, Supervisor, UpstreamError};

/// Outcome of [`Hub::reload`].
#[derive(Debug, Default)]
pub struct ReloadReport {
    pub applied: usize,
    /// Changes that could not be applied, with the reason.
    pub failed: Vec<(ConfigChange, String)>,
}

pub struct Hub {
    registry: Arc<CapabilityRegistry>,
    supervisor: Arc<Supervisor>,
    router: Arc<SmartRouter>,
    dispatcher: Dispatcher,
    /// What the hub is currently running, kept in step with applied changes.
    config: Mutex<HubConfig>,
    stop_tx: watch::Sender<bool>,
    rebuilder: Mutex<Option<JoinHandle<()>>>,
}

impl Hub {
    /// Wire a hub over the given connector and optional embedding provider.
    ///
    /// Without a provider, smart-scoped calls fail with `RoutingUnavailable`
    /// and everything else works normally.
    pub fn new(
        settings: &HubSettings,
        connector: Arc<dyn Connector>,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
    ) -> Self {
        let registry = Arc::new(CapabilityRegistry::new());
        let supervisor = Arc::new(Supervisor::new(
            Arc::clone(&registry),
            connector,
            settings.supervisor.clone(),
        ));
        let router = Arc::new(SmartRouter::new(
            Arc::clone(&registry),
            embedder,
            settings.smart.clone(),
        ));
        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&supervisor),
            Arc::clone(&router),
            settings.dispatch.clone(),
        );
        let (stop_tx, _) = watch::channel(false);

        Self {
            registry,
            supervisor,
            router,
            dispatcher,
            config: Mutex::new(HubConfig {
                settings: settings.clone(),
                ..Default::default()
            }),
            stop_tx,
            rebuilder: Mutex::new(None),
        }
    }

    /// Real transports, plus the HTTP embedding provider when smart routing
    /// is enabled.
    pub fn with_default_stack(settings: &HubSettings) -> Result<Self, SmartError> {
        let embedder: Option<Arc<dyn EmbeddingProvider>> = if settings.smart.enabled {
            Some(Arc::new(HttpEmbeddingProvider::new(&settings.smart)?))
        } else {
            None
        };
        Ok(Self::new(settings, Arc::new(DefaultConnector::new()), embedder))
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────────

    /// Install groups, start every server, and keep the semantic index warm.
    ///
    /// Returns once each enabled server has a first outcome. Failed servers
    /// are reported in the returned statuses; they never fail the start.
    pub async fn start(&self, config: HubConfig) -> Vec<ServerStatus> {
        self.registry.replace_groups(config.groups.clone());
        let specs = config.servers.clone();
        *self.config.lock().await = config;

        let statuses = self.supervisor.start_all(specs).await;

        if let Some(handle) = self.router.spawn_rebuilder(self.stop_tx.subscribe()) {
            *self.rebuilder.lock().await = Some(handle);
        }
        statuses
    }

    /// Stop the rebuilder and every connection, and clear the registry.
    pub async fn shutdown(&self) {
        let _ = self.stop_tx.send(true);
        if let Some(handle) = self.rebuilder.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "index rebuilder ended abnormally");
            }
        }
        self.supervisor.shutdown().await;
        tracing::info!("hub stopped");
    }

    // ─── Configuration ───────────────────────────────────────────────────────

    /// Apply one change from the configuration collaborator.
    pub async fn apply_change(&self, change: ConfigChange) -> Result<(), UpstreamError> {
        let mut config = self.config.lock().await;
        self.supervisor.apply(change.clone()).await?;
        config.apply(&change);
        Ok(())
    }

    /// Reconcile with a whole new configuration.
    ///
    /// Servers and groups are updated in place. Tuning settings only take
    /// effect on restart.
    pub async fn reload(&self, new: HubConfig) -> Result<ReloadReport, ConfigError> {
        crate::config::validate(&new)?;

        let mut config = self.config.lock().await;
        if config.settings != new.settings {
            tracing::warn!("settings changed on reload; they take effect after a restart");
        }

        let mut report = ReloadReport::default();
        for change in diff(&config, &new) {
            match self.supervisor.apply(change.clone()).await {
                Ok(()) => {
                    config.apply(&change);
                    report.applied += 1;
                }
                Err(e) => {
                    tracing::warn!(server = ?change.server_name(), error = %e, "config change failed");
                    report.failed.push((change, e.to_string()));
                }
            }
        }
        tracing::info!(applied = report.applied, failed = report.failed.len(), "configuration reloaded");
        Ok(report)
    }

    /// Snapshot of the configuration the hub is running.
    pub async fn config(&self) -> HubConfig {
        self.config.lock().await.clone()
    }

    // ─── Invocation ──────────────────────────────────────────────────────────

    pub async fn dispatch(&self, request: CallRequest) -> Result<CallOutcome, DispatchError> {
        self.dispatcher.dispatch(request).await
    }

    pub async fn dispatch_envelope(&self, request: CallRequest) -> ResultEnvelope {
        self.dispatcher.dispatch_envelope(request).await
    }

    // ─── Presentation ────────────────────────────────────────────────────────

    /// Capabilities the viewer may see.
    pub fn capabilities(&self, viewer: &Viewer, filter: &CapabilityFilter) -> Vec<CapabilityView> {
        self.registry.list_visible(viewer, filter)
    }

    pub fn capabilities_by_server(&self, viewer: &Viewer, server: &str) -> Vec<CapabilityView> {
        self.registry
            .list_by_server(server)
            .into_iter()
            .filter(|v| viewer.owns(&v.owner))
            .collect()
    }

    /// A group's resolved capabilities. Groups the viewer does not own look
    /// the same as missing ones.
    pub fn capabilities_by_group(&self, viewer: &Viewer, group: &str) -> Result<Vec<CapabilityView>, RegistryError> {
        match self.registry.group(group) {
            Some(g) if viewer.owns(&g.owner) => self.registry.list_by_group(group),
            _ => Err(RegistryError::GroupNotFound {
                name: group.to_string(),
            }),
        }
    }

    /// Toggle one capability. Returns whether anything changed.
    pub fn set_enabled(&self, key: &NamespacedKey, enabled: bool) -> Result<bool, RegistryError> {
        self.registry.set_enabled(key, enabled)
    }

    pub async fn server_status(&self, name: &str) -> Option<ServerStatus> {
        self.supervisor.status(name).await
    }

    pub async fn server_statuses(&self) -> Vec<ServerStatus> {
        self.supervisor.statuses().await
    }

    /// Reconnect a server now instead of waiting out its backoff.
    pub async fn retry_server(&self, name: &str) -> Result<(), UpstreamError> {
        self.supervisor.retry(name).await
    }

    pub fn smart_status(&self) -> SmartStatus {
        self.router.status()
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
