//! Shared types for upstream connections.
//!
//! JSON-RPC 2.0 message types, MCP protocol structures, and the
//! `UpstreamServerSpec` supplied by the configuration layer.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// MCP protocol revision sent in `initialize`.
pub const PROTOCOL_VERSION: &str = "2025-03-26";

// ─── Server Spec ─────────────────────────────────────────────────────────────

/// How the hub reaches an upstream server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Spawned local process speaking newline-delimited JSON-RPC on stdio.
    Stdio,
    /// Legacy HTTP+SSE: GET an event stream, POST to the announced endpoint.
    Sse,
    /// Streamable HTTP: POST per message, JSON or SSE response bodies.
    #[serde(alias = "http", alias = "streamable-http")]
    StreamableHttp,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransportKind::Stdio => "stdio",
            TransportKind::Sse => "sse",
            TransportKind::StreamableHttp => "streamable_http",
        };
        f.write_str(s)
    }
}

/// Definition of one upstream server, owned by the configuration layer.
///
/// Immutable once a connection is established from it: any change tears the
/// connection down and builds a new one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamServerSpec {
    pub name: String,
    #[serde(default = "default_transport")]
    pub transport: TransportKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    /// Working directory for spawned processes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Extra HTTP headers for network transports.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_owner")]
    pub owner: String,
}

fn default_transport() -> TransportKind {
    TransportKind::Stdio
}

fn default_enabled() -> bool {
    true
}

/// Owner assigned to servers and groups that do not name one.
pub const DEFAULT_OWNER: &str = "admin";

fn default_owner() -> String {
    DEFAULT_OWNER.to_string()
}

impl UpstreamServerSpec {
    /// A stdio spec with defaults for everything else.
    pub fn stdio(name: &str, command: &str, args: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            transport: TransportKind::Stdio,
            command: Some(command.to_string()),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: HashMap::new(),
            cwd: None,
            url: None,
            headers: HashMap::new(),
            enabled: true,
            owner: default_owner(),
        }
    }

    /// A network spec (SSE or streamable HTTP) with defaults for everything else.
    pub fn remote(name: &str, transport: TransportKind, url: &str) -> Self {
        Self {
            name: name.to_string(),
            transport,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            url: Some(url.to_string()),
            headers: HashMap::new(),
            enabled: true,
            owner: default_owner(),
        }
    }
}

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response message (success or error).
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    pub id: u64,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

/// A server-initiated notification, delivered apart from call/response pairs.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerNotification {
    pub method: String,
    pub params: Option<serde_json::Value>,
}

impl ServerNotification {
    /// Whether this notification announces a change to a capability list.
    pub fn is_list_changed(&self) -> bool {
        matches!(
            self.method.as_str(),
            methods::TOOLS_LIST_CHANGED
                | methods::PROMPTS_LIST_CHANGED
                | methods::RESOURCES_LIST_CHANGED
        )
    }
}

/// MCP method names used by the hub.
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const PING: &str = "ping";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const PROMPTS_LIST: &str = "prompts/list";
    pub const PROMPTS_GET: &str = "prompts/get";
    pub const RESOURCES_LIST: &str = "resources/list";
    pub const RESOURCES_READ: &str = "resources/read";
    pub const TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";
    pub const PROMPTS_LIST_CHANGED: &str = "notifications/prompts/list_changed";
    pub const RESOURCES_LIST_CHANGED: &str = "notifications/resources/list_changed";
}

// ─── MCP Protocol Types ──────────────────────────────────────────────────────

/// Tool definition as returned by `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, alias = "inputSchema")]
    pub input_schema: serde_json::Value,
}

/// Prompt definition as returned by `prompts/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// Resource definition as returned by `resources/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDefinition {
    pub uri: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, alias = "mimeType")]
    pub mime_type: Option<String>,
}

/// Everything a server declared during discovery.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscoveredCapabilities {
    pub tools: Vec<ToolDefinition>,
    pub prompts: Vec<PromptDefinition>,
    pub resources: Vec<ResourceDefinition>,
}

impl DiscoveredCapabilities {
    /// Total number of declared capabilities.
    pub fn len(&self) -> usize {
        self.tools.len() + self.prompts.len() + self.resources.len()
    }

    /// Whether the server declared nothing.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// MCP initialize response payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InitializeResult {
    #[serde(default, alias = "protocolVersion")]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: serde_json::Value,
    #[serde(default, alias = "serverInfo")]
    pub server_info: Option<ServerInfo>,
    #[serde(default)]
    pub instructions: Option<String>,
}

impl InitializeResult {
    /// Whether the server advertises a capability area (`tools`, `prompts`, `resources`).
    ///
    /// Servers that send no capability object at all are probed for tools only.
    pub fn advertises(&self, area: &str) -> bool {
        match self.capabilities.as_object() {
            Some(caps) if !caps.is_empty() => caps.contains_key(area),
            _ => area == "tools",
        }
    }
}

/// Server info returned in the initialize response.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

// ─── Standard MCP Error Codes ────────────────────────────────────────────────

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_rpc_request_serialization() {
        let req = JsonRpcRequest::new(1, "initialize", None);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"id\":1"));
        assert!(json.contains("\"method\":\"initialize\""));
        assert!(!json.contains("params"));
    }

    #[test]
    fn test_json_rpc_error_response() {
        let json = r#"{
            "jsonrpc": "2.0",
            "id": 2,
            "error": {"code": -32601, "message": "Method not found"}
        }"#;
        let resp: JsonRpcResponse = serde_json::from_str(json).unwrap();
        assert!(resp.result.is_none());
        assert_eq!(resp.error.unwrap().code, error_codes::METHOD_NOT_FOUND);
    }

    #[test]
    fn test_spec_defaults_from_yaml() {
        let yaml = r#"
            name: fs
            command: npx
            args: ["-y", "server-filesystem"]
        "#;
        let spec: UpstreamServerSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.transport, TransportKind::Stdio);
        assert!(spec.enabled);
        assert_eq!(spec.owner, DEFAULT_OWNER);
        assert_eq!(spec.args.len(), 2);
    }

    #[test]
    fn test_transport_kind_aliases() {
        let kind: TransportKind = serde_yaml::from_str("streamable-http").unwrap();
        assert_eq!(kind, TransportKind::StreamableHttp);
        let kind: TransportKind = serde_yaml::from_str("sse").unwrap();
        assert_eq!(kind, TransportKind::Sse);
    }

    #[test]
    fn test_tool_definition_accepts_camel_case_schema() {
        let json = r#"{"name": "read", "inputSchema": {"type": "object"}}"#;
        let tool: ToolDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(tool.input_schema["type"], "object");
        assert!(tool.description.is_none());
    }

    #[test]
    fn test_advertises_capability_areas() {
        let init: InitializeResult = serde_json::from_value(serde_json::json!({
            "capabilities": {"tools": {}, "prompts": {"listChanged": true}}
        }))
        .unwrap();
        assert!(init.advertises("tools"));
        assert!(init.advertises("prompts"));
        assert!(!init.advertises("resources"));

        let bare = InitializeResult::default();
        assert!(bare.advertises("tools"));
        assert!(!bare.advertises("prompts"));
    }

    #[test]
    fn test_list_changed_notifications() {
        let n = ServerNotification {
            method: methods::TOOLS_LIST_CHANGED.into(),
            params: None,
        };
        assert!(n.is_list_changed());
        let other = ServerNotification {
            method: "notifications/message".into(),
            params: None,
        };
        assert!(!other.is_list_changed());
    }
}
