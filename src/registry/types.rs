//! Registry data types: namespaced keys, capabilities, groups, filters.

use serde::{Deserialize, Serialize, Serializer};

use crate::upstream::connection::ConnectionState;
use crate::upstream::types::{PromptDefinition, ResourceDefinition, ToolDefinition};

/// Joins server name and local capability name in a namespaced key.
///
/// Server names may not contain it, so the first occurrence always marks the
/// boundary even when the local name contains it too.
pub const NAMESPACE_SEPARATOR: &str = "__";

// ─── Keys ────────────────────────────────────────────────────────────────────

/// What a capability is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    Tool,
    Prompt,
    Resource,
}

impl CapabilityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityKind::Tool => "tool",
            CapabilityKind::Prompt => "prompt",
            CapabilityKind::Resource => "resource",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tool" => Some(CapabilityKind::Tool),
            "prompt" => Some(CapabilityKind::Prompt),
            "resource" => Some(CapabilityKind::Resource),
            _ => None,
        }
    }
}

impl std::fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registry-wide identity of a capability.
///
/// Displayed as `server__local`. Tools, prompts, and resources live in
/// separate namespaces, so the kind is part of the identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NamespacedKey {
    pub kind: CapabilityKind,
    pub server: String,
    pub local: String,
}

impl NamespacedKey {
    pub fn new(kind: CapabilityKind, server: &str, local: &str) -> Self {
        Self {
            kind,
            server: server.to_string(),
            local: local.to_string(),
        }
    }

    /// Split `server__local` for the given kind.
    pub fn parse(kind: CapabilityKind, name: &str) -> Option<Self> {
        let (server, local) = name.split_once(NAMESPACE_SEPARATOR)?;
        if server.is_empty() || local.is_empty() {
            return None;
        }
        Some(Self::new(kind, server, local))
    }

    /// Parse the `kind:server__local` form produced by [`NamespacedKey::qualified`].
    pub fn parse_qualified(qualified: &str) -> Option<Self> {
        let (kind, rest) = qualified.split_once(':')?;
        Self::parse(CapabilityKind::parse(kind)?, rest)
    }

    /// Kind-qualified form, unique across all capability kinds.
    pub fn qualified(&self) -> String {
        format!("{}:{self}", self.kind)
    }
}

impl std::fmt::Display for NamespacedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{NAMESPACE_SEPARATOR}{}", self.server, self.local)
    }
}

impl Serialize for NamespacedKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

// ─── Capabilities ────────────────────────────────────────────────────────────

/// A tool, prompt, or resource declared by one server.
///
/// The schema payload is opaque: the upstream validates arguments.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Capability {
    pub key: NamespacedKey,
    pub description: Option<String>,
    /// Input schema for tools, argument list for prompts, null for resources.
    pub schema: serde_json::Value,
    /// Human-readable title (resources).
    pub title: Option<String>,
    pub mime_type: Option<String>,
}

impl Capability {
    pub fn kind(&self) -> CapabilityKind {
        self.key.kind
    }

    pub fn server(&self) -> &str {
        &self.key.server
    }

    /// Name the owning server knows this capability by (the URI for resources).
    pub fn local_name(&self) -> &str {
        &self.key.local
    }

    pub fn from_tool(server: &str, tool: &ToolDefinition) -> Self {
        Self {
            key: NamespacedKey::new(CapabilityKind::Tool, server, &tool.name),
            description: tool.description.clone(),
            schema: tool.input_schema.clone(),
            title: None,
            mime_type: None,
        }
    }

    pub fn from_prompt(server: &str, prompt: &PromptDefinition) -> Self {
        Self {
            key: NamespacedKey::new(CapabilityKind::Prompt, server, &prompt.name),
            description: prompt.description.clone(),
            schema: prompt.arguments.clone(),
            title: None,
            mime_type: None,
        }
    }

    pub fn from_resource(server: &str, resource: &ResourceDefinition) -> Self {
        Self {
            key: NamespacedKey::new(CapabilityKind::Resource, server, &resource.uri),
            description: resource.description.clone(),
            schema: serde_json::Value::Null,
            title: resource.name.clone(),
            mime_type: resource.mime_type.clone(),
        }
    }

    /// Text handed to the embedding provider.
    pub fn embedding_text(&self) -> String {
        match self.description.as_deref().filter(|d| !d.trim().is_empty()) {
            Some(desc) => format!("{}: {desc}", self.key.local),
            None => self.key.local.clone(),
        }
    }
}

/// A capability as seen by readers, with its live flags.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapabilityView {
    pub key: NamespacedKey,
    pub kind: CapabilityKind,
    pub server: String,
    pub local_name: String,
    pub description: Option<String>,
    pub schema: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub enabled: bool,
    pub owner: String,
    pub server_state: ConnectionState,
}

// ─── Groups ──────────────────────────────────────────────────────────────────

/// Which capabilities of a member server a group exposes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "ToolFilterRepr", into = "ToolFilterRepr")]
pub enum ToolFilter {
    #[default]
    All,
    List(Vec<String>),
}

impl ToolFilter {
    pub fn allows(&self, local_name: &str) -> bool {
        match self {
            ToolFilter::All => true,
            ToolFilter::List(names) => names.iter().any(|n| n == local_name),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum ToolFilterRepr {
    Keyword(String),
    List(Vec<String>),
}

impl TryFrom<ToolFilterRepr> for ToolFilter {
    type Error = String;

    fn try_from(repr: ToolFilterRepr) -> Result<Self, Self::Error> {
        match repr {
            ToolFilterRepr::Keyword(k) if k.eq_ignore_ascii_case("all") => Ok(ToolFilter::All),
            ToolFilterRepr::Keyword(k) => Err(format!("expected \"all\" or a list, got \"{k}\"")),
            ToolFilterRepr::List(names) => Ok(ToolFilter::List(names)),
        }
    }
}

impl From<ToolFilter> for ToolFilterRepr {
    fn from(filter: ToolFilter) -> Self {
        match filter {
            ToolFilter::All => ToolFilterRepr::Keyword("all".into()),
            ToolFilter::List(names) => ToolFilterRepr::List(names),
        }
    }
}

/// One server entry in a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMember {
    pub server: String,
    #[serde(default)]
    pub tools: ToolFilter,
}

/// A named, owned subset of servers and capabilities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    #[serde(default = "default_owner")]
    pub owner: String,
    #[serde(default)]
    pub members: Vec<GroupMember>,
}

fn default_owner() -> String {
    crate::upstream::types::DEFAULT_OWNER.to_string()
}

// ─── Queries ─────────────────────────────────────────────────────────────────

/// Criteria for [`CapabilityRegistry::list`](super::CapabilityRegistry::list).
#[derive(Debug, Clone, Default)]
pub struct CapabilityFilter {
    pub kind: Option<CapabilityKind>,
    pub server: Option<String>,
    pub owner: Option<String>,
    pub enabled_only: bool,
    /// Case-insensitive substring of the key or description.
    pub text: Option<String>,
}

impl CapabilityFilter {
    pub fn matches(&self, view: &CapabilityView) -> bool {
        if self.kind.is_some_and(|k| k != view.kind) {
            return false;
        }
        if self.server.as_deref().is_some_and(|s| s != view.server) {
            return false;
        }
        if self.owner.as_deref().is_some_and(|o| o != view.owner) {
            return false;
        }
        if self.enabled_only && !view.enabled {
            return false;
        }
        if let Some(text) = &self.text {
            let needle = text.to_lowercase();
            let in_key = view.key.to_string().to_lowercase().contains(&needle);
            let in_desc = view
                .description
                .as_deref()
                .is_some_and(|d| d.to_lowercase().contains(&needle));
            if !in_key && !in_desc {
                return false;
            }
        }
        true
    }
}

/// Who is asking, for owner-based visibility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Viewer {
    pub name: String,
    pub admin: bool,
}

impl Viewer {
    pub fn admin() -> Self {
        Self {
            name: crate::upstream::types::DEFAULT_OWNER.to_string(),
            admin: true,
        }
    }

    pub fn user(name: &str) -> Self {
        Self {
            name: name.to_string(),
            admin: false,
        }
    }

    pub fn owns(&self, owner: &str) -> bool {
        self.admin || self.name == owner
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_display_and_parse() {
        let key = NamespacedKey::new(CapabilityKind::Tool, "fs", "read_file");
        assert_eq!(key.to_string(), "fs__read_file");
        assert_eq!(key.qualified(), "tool:fs__read_file");
        assert_eq!(NamespacedKey::parse(CapabilityKind::Tool, "fs__read_file"), Some(key.clone()));
        assert_eq!(NamespacedKey::parse_qualified("tool:fs__read_file"), Some(key));
    }

    #[test]
    fn test_key_splits_at_first_separator() {
        let key = NamespacedKey::parse(CapabilityKind::Tool, "fs__read__file").unwrap();
        assert_eq!(key.server, "fs");
        assert_eq!(key.local, "read__file");
        assert!(NamespacedKey::parse(CapabilityKind::Tool, "bare").is_none());
        assert!(NamespacedKey::parse(CapabilityKind::Tool, "__x").is_none());
    }

    #[test]
    fn test_same_local_name_on_two_servers_differs() {
        let a = NamespacedKey::new(CapabilityKind::Tool, "a", "search");
        let b = NamespacedKey::new(CapabilityKind::Tool, "b", "search");
        assert_ne!(a, b);
        assert_ne!(a.to_string(), b.to_string());
    }

    #[test]
    fn test_tool_filter_yaml_forms() {
        let all: ToolFilter = serde_yaml::from_str("all").unwrap();
        assert_eq!(all, ToolFilter::All);
        let list: ToolFilter = serde_yaml::from_str("[alpha, beta]").unwrap();
        assert!(list.allows("alpha"));
        assert!(!list.allows("gamma"));
        assert!(serde_yaml::from_str::<ToolFilter>("some").is_err());
    }

    #[test]
    fn test_group_member_defaults_to_all() {
        let member: GroupMember = serde_yaml::from_str("server: x").unwrap();
        assert_eq!(member.tools, ToolFilter::All);
    }

    #[test]
    fn test_embedding_text() {
        let tool = ToolDefinition {
            name: "read".into(),
            description: Some("Read a file".into()),
            input_schema: serde_json::json!({}),
        };
        assert_eq!(Capability::from_tool("fs", &tool).embedding_text(), "read: Read a file");
    }

    #[test]
    fn test_viewer_ownership() {
        assert!(Viewer::admin().owns("bob"));
        assert!(Viewer::user("bob").owns("bob"));
        assert!(!Viewer::user("bob").owns("alice"));
    }
}
