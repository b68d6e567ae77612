//! The capability registry: a read-mostly projection of every live server.
//!
//! Each server's capabilities live in one immutable `ServerSection` behind an
//! `Arc`. Publishing swaps the whole section in a single map insert, so
//! readers see either the previous set or the new one, never a mix. The
//! admin enable/disable overlay is kept apart from sections so it survives
//! reconnects.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use dashmap::{DashMap, DashSet};
use tokio::sync::watch;

use super::errors::RegistryError;
use super::types::{
    Capability, CapabilityFilter, CapabilityKind, CapabilityView, Group, NamespacedKey, Viewer,
};
use crate::upstream::connection::ConnectionState;
use crate::upstream::types::{DiscoveredCapabilities, UpstreamServerSpec};

/// All capabilities of one server, published atomically.
#[derive(Debug, Clone)]
struct ServerSection {
    owner: String,
    state: ConnectionState,
    capabilities: BTreeMap<NamespacedKey, Arc<Capability>>,
}

/// Aggregated, namespaced view of every published server.
pub struct CapabilityRegistry {
    sections: DashMap<String, Arc<ServerSection>>,
    disabled: DashSet<NamespacedKey>,
    groups: RwLock<Arc<Vec<Group>>>,
    generation: AtomicU64,
    changes: watch::Sender<u64>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            sections: DashMap::new(),
            disabled: DashSet::new(),
            groups: RwLock::new(Arc::new(Vec::new())),
            generation: AtomicU64::new(0),
            changes,
        }
    }

    /// Bump the generation and wake subscribers.
    fn touch(&self) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.changes.send_replace(generation);
    }

    /// Monotonic counter of changes to the enabled capability set.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Receive the generation after every change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    // ─── Supervisor Writes ───────────────────────────────────────────────────

    /// Replace a server's whole capability set. Returns the number published.
    pub fn publish_server(
        &self,
        spec: &UpstreamServerSpec,
        state: ConnectionState,
        discovered: &DiscoveredCapabilities,
    ) -> usize {
        let server = spec.name.as_str();
        let mut capabilities = BTreeMap::new();
        let all = discovered
            .tools
            .iter()
            .map(|t| Capability::from_tool(server, t))
            .chain(discovered.prompts.iter().map(|p| Capability::from_prompt(server, p)))
            .chain(discovered.resources.iter().map(|r| Capability::from_resource(server, r)));
        for capability in all {
            let key = capability.key.clone();
            if capabilities.insert(key.clone(), Arc::new(capability)).is_some() {
                tracing::warn!(server, key = %key.qualified(), "server declared a capability twice, keeping the last");
            }
        }

        let count = capabilities.len();
        self.sections.insert(
            server.to_string(),
            Arc::new(ServerSection {
                owner: spec.owner.clone(),
                state,
                capabilities,
            }),
        );
        self.touch();
        tracing::info!(server, capabilities = count, "server published");
        count
    }

    /// Remove a server's section entirely. Returns whether one existed.
    pub fn withdraw_server(&self, server: &str) -> bool {
        let removed = self.sections.remove(server).is_some();
        if removed {
            self.touch();
            tracing::info!(server, "server withdrawn");
        }
        removed
    }

    /// Withdraw a server that left the configuration and drop its
    /// enable/disable overrides, which otherwise outlive reconnects.
    pub fn forget_server(&self, server: &str) {
        self.withdraw_server(server);
        let before = self.disabled.len();
        self.disabled.retain(|key| key.server != server);
        if self.disabled.len() != before {
            tracing::debug!(server, dropped = before - self.disabled.len(), "disabled flags pruned");
        }
    }

    /// Update the connectivity state shown alongside a server's capabilities.
    pub fn set_server_state(&self, server: &str, state: ConnectionState) {
        if let Some(mut entry) = self.sections.get_mut(server) {
            if entry.state != state {
                Arc::make_mut(entry.value_mut()).state = state;
            }
        }
    }

    /// Drop every section (shutdown).
    pub fn clear(&self) {
        self.sections.clear();
        self.touch();
    }

    // ─── Reads ───────────────────────────────────────────────────────────────

    fn section(&self, server: &str) -> Option<Arc<ServerSection>> {
        self.sections.get(server).map(|s| Arc::clone(s.value()))
    }

    fn snapshot(&self) -> Vec<(String, Arc<ServerSection>)> {
        let mut sections: Vec<_> = self
            .sections
            .iter()
            .map(|s| (s.key().clone(), Arc::clone(s.value())))
            .collect();
        sections.sort_by(|a, b| a.0.cmp(&b.0));
        sections
    }

    fn view(&self, section: &ServerSection, capability: &Capability) -> CapabilityView {
        CapabilityView {
            key: capability.key.clone(),
            kind: capability.kind(),
            server: capability.server().to_string(),
            local_name: capability.local_name().to_string(),
            description: capability.description.clone(),
            schema: capability.schema.clone(),
            title: capability.title.clone(),
            mime_type: capability.mime_type.clone(),
            enabled: !self.disabled.contains(&capability.key),
            owner: section.owner.clone(),
            server_state: section.state,
        }
    }

    /// Every capability matching `filter`, ordered by server then key.
    pub fn list(&self, filter: &CapabilityFilter) -> Vec<CapabilityView> {
        self.snapshot()
            .iter()
            .flat_map(|(_, section)| {
                section
                    .capabilities
                    .values()
                    .map(|c| self.view(section, c))
                    .collect::<Vec<_>>()
            })
            .filter(|v| filter.matches(v))
            .collect()
    }

    pub fn get(&self, key: &NamespacedKey) -> Option<CapabilityView> {
        let section = self.section(&key.server)?;
        let capability = section.capabilities.get(key)?;
        Some(self.view(&section, capability))
    }

    /// Look up a capability by its local name on one server.
    pub fn find(&self, server: &str, kind: CapabilityKind, local: &str) -> Option<CapabilityView> {
        self.get(&NamespacedKey::new(kind, server, local))
    }

    /// A server's capabilities. Unknown or unpublished servers yield nothing.
    pub fn list_by_server(&self, server: &str) -> Vec<CapabilityView> {
        match self.section(server) {
            Some(section) => section
                .capabilities
                .values()
                .map(|c| self.view(&section, c))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Resolve a group against live sections.
    ///
    /// Members are walked in declaration order; within a member, an explicit
    /// allow-list keeps its own order. Servers or capabilities that are not
    /// published are skipped.
    pub fn list_by_group(&self, group: &str) -> Result<Vec<CapabilityView>, RegistryError> {
        let group = self.group(group).ok_or_else(|| RegistryError::GroupNotFound {
            name: group.to_string(),
        })?;

        let mut seen = HashSet::new();
        let mut views = Vec::new();
        for member in &group.members {
            let Some(section) = self.section(&member.server) else {
                continue;
            };
            let selected: Vec<&Arc<Capability>> = match &member.tools {
                super::types::ToolFilter::All => section.capabilities.values().collect(),
                super::types::ToolFilter::List(names) => names
                    .iter()
                    .flat_map(|name| {
                        [CapabilityKind::Tool, CapabilityKind::Prompt, CapabilityKind::Resource]
                            .into_iter()
                            .filter_map(|kind| {
                                section
                                    .capabilities
                                    .get(&NamespacedKey::new(kind, &member.server, name))
                            })
                    })
                    .collect(),
            };
            for capability in selected {
                if seen.insert(capability.key.clone()) {
                    views.push(self.view(&section, capability));
                }
            }
        }
        Ok(views)
    }

    /// Capabilities a viewer may see: everything for admins, otherwise those
    /// of servers they own plus those reachable through groups they own.
    pub fn list_visible(&self, viewer: &Viewer, filter: &CapabilityFilter) -> Vec<CapabilityView> {
        if viewer.admin {
            return self.list(filter);
        }
        let mut seen = HashSet::new();
        let mut views: Vec<CapabilityView> = self
            .list(filter)
            .into_iter()
            .filter(|v| viewer.owns(&v.owner))
            .inspect(|v| {
                seen.insert(v.key.clone());
            })
            .collect();
        for group in self.visible_groups(viewer) {
            if let Ok(members) = self.list_by_group(&group.name) {
                views.extend(
                    members
                        .into_iter()
                        .filter(|v| filter.matches(v))
                        .filter(|v| seen.insert(v.key.clone())),
                );
            }
        }
        views
    }

    /// Published server names, sorted.
    pub fn server_names(&self) -> Vec<String> {
        self.snapshot().into_iter().map(|(name, _)| name).collect()
    }

    /// Enabled capabilities of the given kinds, for indexing.
    pub fn enabled_capabilities(&self, kinds: &[CapabilityKind]) -> Vec<Arc<Capability>> {
        self.snapshot()
            .iter()
            .flat_map(|(_, section)| section.capabilities.values().cloned().collect::<Vec<_>>())
            .filter(|c| kinds.contains(&c.kind()) && !self.disabled.contains(&c.key))
            .collect()
    }

    pub fn is_enabled(&self, key: &NamespacedKey) -> bool {
        !self.disabled.contains(key)
    }

    // ─── Admin Toggle ────────────────────────────────────────────────────────

    /// Enable or disable one capability without touching connectivity.
    ///
    /// Returns whether anything changed; repeating a toggle is a no-op.
    pub fn set_enabled(&self, key: &NamespacedKey, enabled: bool) -> Result<bool, RegistryError> {
        let exists = self
            .section(&key.server)
            .is_some_and(|s| s.capabilities.contains_key(key));
        if !exists {
            return Err(RegistryError::NotFound {
                key: key.qualified(),
            });
        }

        let changed = if enabled {
            self.disabled.remove(key).is_some()
        } else {
            self.disabled.insert(key.clone())
        };
        if changed {
            self.touch();
            tracing::info!(key = %key.qualified(), enabled, "capability toggled");
        }
        Ok(changed)
    }

    // ─── Groups ──────────────────────────────────────────────────────────────

    pub fn replace_groups(&self, groups: Vec<Group>) {
        if let Ok(mut current) = self.groups.write() {
            *current = Arc::new(groups);
        }
        self.touch();
    }

    pub fn groups(&self) -> Arc<Vec<Group>> {
        self.groups
            .read()
            .map(|g| Arc::clone(&*g))
            .unwrap_or_default()
    }

    pub fn group(&self, name: &str) -> Option<Group> {
        self.groups().iter().find(|g| g.name == name).cloned()
    }

    pub fn visible_groups(&self, viewer: &Viewer) -> Vec<Group> {
        self.groups()
            .iter()
            .filter(|g| viewer.owns(&g.owner))
            .cloned()
            .collect()
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
