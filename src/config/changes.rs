//! Configuration change events.
//!
//! The configuration collaborator notifies the hub of edits as a stream of
//! `ConfigChange`s. A whole reloaded file is turned into the same events by
//! [`diff`].

use serde::{Deserialize, Serialize};

use super::loader::HubConfig;
use crate::registry::Group;
use crate::upstream::types::UpstreamServerSpec;

/// One edit to the set of servers or groups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConfigChange {
    /// Add a server, or replace its definition. Always re-arms retries.
    UpsertServer { spec: UpstreamServerSpec },
    RemoveServer { name: String },
    SetServerEnabled { name: String, enabled: bool },
    ReplaceGroups { groups: Vec<Group> },
}

impl ConfigChange {
    /// Server this change targets, if any.
    pub fn server_name(&self) -> Option<&str> {
        match self {
            ConfigChange::UpsertServer { spec } => Some(&spec.name),
            ConfigChange::RemoveServer { name } | ConfigChange::SetServerEnabled { name, .. } => {
                Some(name)
            }
            ConfigChange::ReplaceGroups { .. } => None,
        }
    }
}

/// Compute the changes that turn `old` into `new`.
///
/// Removals come first, then additions and edits in `new`'s declaration
/// order, then a group replacement if the groups differ. A spec that differs
/// only in `enabled` becomes a `SetServerEnabled`.
pub fn diff(old: &HubConfig, new: &HubConfig) -> Vec<ConfigChange> {
    let mut changes = Vec::new();

    for spec in &old.servers {
        if new.server(&spec.name).is_none() {
            changes.push(ConfigChange::RemoveServer {
                name: spec.name.clone(),
            });
        }
    }

    for spec in &new.servers {
        match old.server(&spec.name) {
            None => changes.push(ConfigChange::UpsertServer { spec: spec.clone() }),
            Some(previous) if previous == spec => {}
            Some(previous) if differs_only_in_enabled(previous, spec) => {
                changes.push(ConfigChange::SetServerEnabled {
                    name: spec.name.clone(),
                    enabled: spec.enabled,
                });
            }
            Some(_) => changes.push(ConfigChange::UpsertServer { spec: spec.clone() }),
        }
    }

    if old.groups != new.groups {
        changes.push(ConfigChange::ReplaceGroups {
            groups: new.groups.clone(),
        });
    }

    changes
}

impl HubConfig {
    /// Fold one change into this configuration so later diffs start from
    /// what the hub is actually running.
    pub fn apply(&mut self, change: &ConfigChange) {
        match change {
            ConfigChange::UpsertServer { spec } => {
                match self.servers.iter_mut().find(|s| s.name == spec.name) {
                    Some(existing) => *existing = spec.clone(),
                    None => self.servers.push(spec.clone()),
                }
            }
            ConfigChange::RemoveServer { name } => self.servers.retain(|s| &s.name != name),
            ConfigChange::SetServerEnabled { name, enabled } => {
                if let Some(spec) = self.servers.iter_mut().find(|s| &s.name == name) {
                    spec.enabled = *enabled;
                }
            }
            ConfigChange::ReplaceGroups { groups } => self.groups = groups.clone(),
        }
    }
}

fn differs_only_in_enabled(a: &UpstreamServerSpec, b: &UpstreamServerSpec) -> bool {
    a.enabled != b.enabled
        && UpstreamServerSpec {
            enabled: b.enabled,
            ..a.clone()
        } == *b
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{GroupMember, ToolFilter};

    fn config(servers: Vec<UpstreamServerSpec>) -> HubConfig {
        HubConfig {
            servers,
            ..Default::default()
        }
    }

    #[test]
    fn test_identical_configs_produce_no_changes() {
        let a = config(vec![UpstreamServerSpec::stdio("fs", "npx", &[])]);
        assert!(diff(&a, &a.clone()).is_empty());
    }

    #[test]
    fn test_add_remove_and_edit() {
        let old = config(vec![
            UpstreamServerSpec::stdio("gone", "x", &[]),
            UpstreamServerSpec::stdio("fs", "npx", &["a"]),
        ]);
        let new = config(vec![
            UpstreamServerSpec::stdio("fs", "npx", &["b"]),
            UpstreamServerSpec::stdio("fresh", "y", &[]),
        ]);

        let changes = diff(&old, &new);
        assert_eq!(changes.len(), 3);
        assert_eq!(changes[0], ConfigChange::RemoveServer { name: "gone".into() });
        assert_eq!(changes[1].server_name(), Some("fs"));
        assert!(matches!(changes[1], ConfigChange::UpsertServer { .. }));
        assert_eq!(changes[2].server_name(), Some("fresh"));
    }

    #[test]
    fn test_enabled_toggle_is_its_own_change() {
        let old = config(vec![UpstreamServerSpec::stdio("fs", "npx", &[])]);
        let mut disabled = UpstreamServerSpec::stdio("fs", "npx", &[]);
        disabled.enabled = false;
        let new = config(vec![disabled]);

        assert_eq!(
            diff(&old, &new),
            vec![ConfigChange::SetServerEnabled {
                name: "fs".into(),
                enabled: false
            }]
        );
    }

    #[test]
    fn test_applying_a_diff_reaches_the_target() {
        let old = config(vec![
            UpstreamServerSpec::stdio("gone", "x", &[]),
            UpstreamServerSpec::stdio("fs", "npx", &["a"]),
        ]);
        let mut toggled = UpstreamServerSpec::stdio("fs", "npx", &["a"]);
        toggled.enabled = false;
        let new = config(vec![toggled, UpstreamServerSpec::stdio("fresh", "y", &[])]);

        let mut current = old.clone();
        for change in diff(&old, &new) {
            current.apply(&change);
        }
        assert_eq!(current.servers, new.servers);
        assert!(diff(&current, &new).is_empty());
    }

    #[test]
    fn test_group_changes_replace_all_groups() {
        let old = HubConfig::default();
        let new = HubConfig {
            groups: vec![Group {
                name: "G".into(),
                owner: "admin".into(),
                members: vec![GroupMember {
                    server: "fs".into(),
                    tools: ToolFilter::All,
                }],
            }],
            ..Default::default()
        };
        let changes = diff(&old, &new);
        assert!(matches!(&changes[..], [ConfigChange::ReplaceGroups { groups }] if groups.len() == 1));
    }
}
