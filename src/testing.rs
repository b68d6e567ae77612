//! In-memory test doubles: a scripted upstream server, a connector that
//! hands out transports to it, and a deterministic embedding provider.

use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::smart::{EmbeddingProvider, SmartError};
use crate::upstream::errors::UpstreamError;
use crate::upstream::transport::{Connector, OpenedTransport, Transport};
use crate::upstream::types::{
    error_codes, methods, JsonRpcError, JsonRpcResponse, PromptDefinition, ResourceDefinition,
    ServerNotification, ToolDefinition, UpstreamServerSpec, PROTOCOL_VERSION,
};

// ─── Mock Server ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct MockState {
    tools: Vec<ToolDefinition>,
    prompts: Vec<PromptDefinition>,
    resources: Vec<ResourceDefinition>,
    page_size: Option<usize>,
    failing: HashSet<String>,
    advertised: Option<Vec<String>>,
    call_delay: Option<Duration>,
    init_delay: Option<Duration>,
    list_delay: Option<Duration>,
    calls: Vec<(String, Value)>,
}

/// A scripted upstream server. Clones share state, so a test can change a
/// server after handing it to a [`MockConnector`].
#[derive(Clone)]
pub struct MockServer {
    name: String,
    state: Arc<Mutex<MockState>>,
}

impl MockServer {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    fn edit(self, f: impl FnOnce(&mut MockState)) -> Self {
        f(&mut self.state.lock().unwrap());
        self
    }

    pub fn with_tool(self, name: &str, description: &str) -> Self {
        self.edit(|s| s.tools.push(tool(name, description)))
    }

    pub fn with_prompt(self, name: &str, description: &str) -> Self {
        self.edit(|s| {
            s.prompts.push(PromptDefinition {
                name: name.to_string(),
                description: Some(description.to_string()),
                arguments: json!([]),
            })
        })
    }

    pub fn with_resource(self, uri: &str, name: &str) -> Self {
        self.edit(|s| {
            s.resources.push(ResourceDefinition {
                uri: uri.to_string(),
                name: Some(name.to_string()),
                description: None,
                mime_type: Some("text/plain".into()),
            })
        })
    }

    pub fn with_page_size(self, size: usize) -> Self {
        self.edit(|s| s.page_size = Some(size.max(1)))
    }

    /// Make every request for `method` fail at the channel level.
    pub fn failing_method(self, method: &str) -> Self {
        self.edit(|s| {
            s.failing.insert(method.to_string());
        })
    }

    /// Advertise only these capability areas in `initialize`.
    pub fn advertising(self, areas: &[&str]) -> Self {
        self.edit(|s| s.advertised = Some(areas.iter().map(|a| a.to_string()).collect()))
    }

    /// Delay every `tools/call` response.
    pub fn with_delay(self, delay: Duration) -> Self {
        self.edit(|s| s.call_delay = Some(delay))
    }

    /// Delay the `initialize` response.
    pub fn with_init_delay(self, delay: Duration) -> Self {
        self.edit(|s| s.init_delay = Some(delay))
    }

    pub fn spec(&self) -> UpstreamServerSpec {
        UpstreamServerSpec::stdio(&self.name, "mock-server", &[])
    }

    /// Delay every list response from now on, or stop delaying with `None`.
    pub fn set_list_delay(&self, delay: Option<Duration>) {
        self.state.lock().unwrap().list_delay = delay;
    }

    /// Add a tool to a running server.
    pub fn add_tool(&self, name: &str, description: &str) {
        self.state.lock().unwrap().tools.push(tool(name, description));
    }

    pub fn set_failing(&self, method: &str, failing: bool) {
        let mut state = self.state.lock().unwrap();
        if failing {
            state.failing.insert(method.to_string());
        } else {
            state.failing.remove(method);
        }
    }

    /// Every invocation received, as `(method, params)`.
    pub fn calls(&self) -> Vec<(String, Value)> {
        self.state.lock().unwrap().calls.clone()
    }

    async fn handle(&self, id: u64, method: &str, params: Option<Value>) -> Result<JsonRpcResponse, UpstreamError> {
        let params = params.unwrap_or(Value::Null);
        let (failing, init_delay, call_delay, list_delay) = {
            let state = self.state.lock().unwrap();
            (
                state.failing.contains(method),
                state.init_delay,
                state.call_delay,
                state.list_delay,
            )
        };
        if failing {
            return Err(UpstreamError::TransportError {
                server: self.name.clone(),
                reason: format!("injected failure for {method}"),
            });
        }

        if matches!(method, methods::TOOLS_LIST | methods::PROMPTS_LIST | methods::RESOURCES_LIST) {
            if let Some(delay) = list_delay {
                tokio::time::sleep(delay).await;
            }
        }

        let outcome = match method {
            methods::INITIALIZE => {
                if let Some(delay) = init_delay {
                    tokio::time::sleep(delay).await;
                }
                Ok(self.initialize_result())
            }
            methods::PING => Ok(json!({})),
            methods::TOOLS_LIST => Ok(self.page("tools", &params)),
            methods::PROMPTS_LIST => Ok(self.page("prompts", &params)),
            methods::RESOURCES_LIST => Ok(self.page("resources", &params)),
            methods::TOOLS_CALL => {
                if let Some(delay) = call_delay {
                    tokio::time::sleep(delay).await;
                }
                self.call_tool(&params)
            }
            methods::PROMPTS_GET => self.get_prompt(&params),
            methods::RESOURCES_READ => self.read_resource(&params),
            other => Err((error_codes::METHOD_NOT_FOUND, format!("unknown method {other}"))),
        };

        Ok(match outcome {
            Ok(result) => JsonRpcResponse {
                id,
                result: Some(result),
                error: None,
            },
            Err((code, message)) => JsonRpcResponse {
                id,
                result: None,
                error: Some(JsonRpcError {
                    code,
                    message,
                    data: None,
                }),
            },
        })
    }

    fn initialize_result(&self) -> Value {
        let state = self.state.lock().unwrap();
        let areas: Vec<String> = state
            .advertised
            .clone()
            .unwrap_or_else(|| vec!["tools".into(), "prompts".into(), "resources".into()]);
        let capabilities: serde_json::Map<String, Value> = areas
            .into_iter()
            .map(|area| (area, json!({ "listChanged": true })))
            .collect();
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": capabilities,
            "serverInfo": { "name": self.name, "version": "1.0.0" },
            "instructions": format!("mock server {}", self.name),
        })
    }

    fn page(&self, field: &str, params: &Value) -> Value {
        let state = self.state.lock().unwrap();
        let items: Vec<Value> = match field {
            "tools" => state.tools.iter().map(|t| json!(t)).collect(),
            "prompts" => state.prompts.iter().map(|p| json!(p)).collect(),
            _ => state.resources.iter().map(|r| json!(r)).collect(),
        };
        let start = params
            .get("cursor")
            .and_then(|c| c.as_str())
            .and_then(|c| c.parse::<usize>().ok())
            .unwrap_or(0);
        let size = state.page_size.unwrap_or(usize::MAX);
        let end = start.saturating_add(size).min(items.len());
        let page: Vec<Value> = items.get(start..end).unwrap_or_default().to_vec();

        let mut result = json!({ field: page });
        if end < items.len() {
            result["nextCursor"] = json!(end.to_string());
        }
        result
    }

    fn record(&self, method: &str, params: &Value) {
        self.state
            .lock()
            .unwrap()
            .calls
            .push((method.to_string(), params.clone()));
    }

    fn call_tool(&self, params: &Value) -> Result<Value, (i32, String)> {
        let name = params.get("name").and_then(|n| n.as_str()).unwrap_or_default();
        let known = self.state.lock().unwrap().tools.iter().any(|t| t.name == name);
        if !known {
            return Err((error_codes::INVALID_PARAMS, format!("unknown tool: {name}")));
        }
        self.record(methods::TOOLS_CALL, params);

        let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);
        if arguments.get("fail").and_then(|f| f.as_bool()) == Some(true) {
            return Ok(json!({
                "content": [{ "type": "text", "text": "tool failed on purpose" }],
                "isError": true,
            }));
        }
        Ok(json!({
            "content": [{ "type": "text", "text": format!("{}:{name}", self.name) }],
            "isError": false,
        }))
    }

    fn get_prompt(&self, params: &Value) -> Result<Value, (i32, String)> {
        let name = params.get("name").and_then(|n| n.as_str()).unwrap_or_default();
        let prompt = self
            .state
            .lock()
            .unwrap()
            .prompts
            .iter()
            .find(|p| p.name == name)
            .cloned()
            .ok_or_else(|| (error_codes::INVALID_PARAMS, format!("unknown prompt: {name}")))?;
        self.record(methods::PROMPTS_GET, params);
        Ok(json!({
            "description": prompt.description,
            "messages": [{ "role": "user", "content": { "type": "text", "text": name } }],
        }))
    }

    fn read_resource(&self, params: &Value) -> Result<Value, (i32, String)> {
        let uri = params.get("uri").and_then(|u| u.as_str()).unwrap_or_default();
        let known = self.state.lock().unwrap().resources.iter().any(|r| r.uri == uri);
        if !known {
            return Err((error_codes::INVALID_PARAMS, format!("unknown resource: {uri}")));
        }
        self.record(methods::RESOURCES_READ, params);
        Ok(json!({ "contents": [{ "uri": uri, "text": "contents" }] }))
    }
}

fn tool(name: &str, description: &str) -> ToolDefinition {
    ToolDefinition {
        name: name.to_string(),
        description: Some(description.to_string()),
        input_schema: json!({ "type": "object" }),
    }
}

// ─── Mock Transport ──────────────────────────────────────────────────────────

struct MockTransport {
    server: MockServer,
    closed: AtomicBool,
    notifications: Mutex<Option<mpsc::UnboundedSender<ServerNotification>>>,
}

#[async_trait]
impl Transport for MockTransport {
    fn server_name(&self) -> &str {
        &self.server.name
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse, UpstreamError> {
        if self.is_closed() {
            return Err(UpstreamError::TransportError {
                server: self.server.name.clone(),
                reason: "channel closed".into(),
            });
        }
        let id = crate::upstream::transport::next_request_id();
        self.server.handle(id, method, params).await
    }

    async fn notify(&self, _method: &str, _params: Option<Value>) -> Result<(), UpstreamError> {
        if self.is_closed() {
            return Err(UpstreamError::TransportError {
                server: self.server.name.clone(),
                reason: "channel closed".into(),
            });
        }
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notifications.lock().unwrap().take();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

// ─── Mock Connector ──────────────────────────────────────────────────────────

/// Connector over registered [`MockServer`]s. Unknown names fail to spawn.
#[derive(Clone, Default)]
pub struct MockConnector {
    servers: Arc<Mutex<HashMap<String, MockServer>>>,
    transports: Arc<Mutex<HashMap<String, Vec<Weak<MockTransport>>>>>,
    opened: Arc<Mutex<HashMap<String, usize>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, server: MockServer) {
        self.servers.lock().unwrap().insert(server.name.clone(), server);
    }

    fn live(&self, name: &str) -> Vec<Arc<MockTransport>> {
        self.transports
            .lock()
            .unwrap()
            .get(name)
            .map(|list| list.iter().filter_map(Weak::upgrade).filter(|t| !t.is_closed()).collect())
            .unwrap_or_default()
    }

    /// Transports for `name` that are neither closed nor dropped.
    pub fn live_transports(&self, name: &str) -> usize {
        self.live(name).len()
    }

    /// How many times a transport was opened for `name`.
    pub fn opened(&self, name: &str) -> usize {
        self.opened.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    pub fn set_failing(&self, name: &str, method: &str, failing: bool) {
        if let Some(server) = self.servers.lock().unwrap().get(name) {
            server.set_failing(method, failing);
        }
    }

    /// Push a server notification on every live transport of `name`.
    pub fn push_notification(&self, name: &str, method: &str) {
        for transport in self.live(name) {
            if let Some(tx) = transport.notifications.lock().unwrap().as_ref() {
                let _ = tx.send(ServerNotification {
                    method: method.to_string(),
                    params: None,
                });
            }
        }
    }

    /// Simulate a crash: close every live transport of `name`.
    pub async fn kill(&self, name: &str) {
        for transport in self.live(name) {
            transport.close().await;
        }
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, spec: &UpstreamServerSpec) -> Result<OpenedTransport, UpstreamError> {
        let server = self
            .servers
            .lock()
            .unwrap()
            .get(&spec.name)
            .cloned()
            .ok_or_else(|| UpstreamError::SpawnFailed {
                name: spec.name.clone(),
                reason: "No such file or directory (os error 2)".into(),
            })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(MockTransport {
            server,
            closed: AtomicBool::new(false),
            notifications: Mutex::new(Some(tx)),
        });
        self.transports
            .lock()
            .unwrap()
            .entry(spec.name.clone())
            .or_default()
            .push(Arc::downgrade(&transport));
        *self.opened.lock().unwrap().entry(spec.name.clone()).or_default() += 1;

        Ok(OpenedTransport {
            transport,
            notifications: rx,
        })
    }
}

// ─── Fake Embedder ───────────────────────────────────────────────────────────

const FAKE_DIMENSION: usize = 1024;

/// Bag-of-words embedder: each lowercase word hashes into one bucket.
pub struct FakeEmbedder {
    available: AtomicBool,
    embedded: AtomicUsize,
}

impl FakeEmbedder {
    pub fn new() -> Self {
        Self {
            available: AtomicBool::new(true),
            embedded: AtomicUsize::new(0),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Total number of texts embedded so far.
    pub fn embedded_texts(&self) -> usize {
        self.embedded.load(Ordering::SeqCst)
    }

    fn vectorize(text: &str) -> Vec<f32> {
        let mut vector = vec![0.0; FAKE_DIMENSION];
        for word in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            word.hash(&mut hasher);
            vector[(hasher.finish() % FAKE_DIMENSION as u64) as usize] += 1.0;
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for FakeEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, SmartError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(SmartError::RequestFailed {
                reason: "connection refused".into(),
            });
        }
        self.embedded.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(texts.iter().map(|t| Self::vectorize(t)).collect())
    }
}

/// Poll `condition` until it holds or five seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
