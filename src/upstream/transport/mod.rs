//! Transport adapters, one per connection kind.
//!
//! Every adapter exchanges JSON-RPC messages with one upstream server:
//! - `stdio`: spawned child process, newline-delimited JSON
//! - `sse`: legacy HTTP+SSE (GET event stream, POST to announced endpoint)
//! - `streamable`: streamable HTTP (POST per message, JSON or SSE bodies)
//!
//! Requests are correlated by id through [`PendingRequests`], so concurrent
//! calls on one channel never cross-deliver. Server-initiated notifications
//! travel on a separate channel handed out by [`Connector::open`].

pub mod sse;
pub mod sse_parser;
pub mod stdio;
pub mod streamable;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use super::errors::UpstreamError;
use super::types::{
    error_codes, methods, JsonRpcResponse, ServerNotification, TransportKind, UpstreamServerSpec,
};

// ─── Request ID Generator ────────────────────────────────────────────────────

/// Global monotonic request ID counter.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique request ID.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── Transport Contract ──────────────────────────────────────────────────────

/// A logical JSON-RPC channel to one upstream server.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Name of the server this channel talks to.
    fn server_name(&self) -> &str;

    /// Send a request and wait for the response with the same id.
    ///
    /// Fails with `TransportError` when the channel is lost. Application
    /// errors come back inside the `JsonRpcResponse`.
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, UpstreamError>;

    /// Send a notification (no response expected).
    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), UpstreamError>;

    /// Called once the handshake has completed.
    async fn on_initialized(&self) {}

    /// Release OS resources. Idempotent.
    async fn close(&self);

    /// Whether the channel has been closed or lost.
    fn is_closed(&self) -> bool;

    /// Recent diagnostic output (e.g. stderr of a spawned process).
    fn diagnostics(&self) -> Option<String> {
        None
    }
}

/// A freshly opened channel plus its notification stream.
///
/// The notification receiver closes when the channel is lost, which is how
/// the owning connection learns about an unexpected disconnect.
pub struct OpenedTransport {
    pub transport: Arc<dyn Transport>,
    pub notifications: mpsc::UnboundedReceiver<ServerNotification>,
}

/// Opens transports for server specs.
///
/// Injected into the supervisor so tests can substitute in-memory servers.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, spec: &UpstreamServerSpec) -> Result<OpenedTransport, UpstreamError>;
}

/// Connector that opens real processes and network connections.
#[derive(Clone)]
pub struct DefaultConnector {
    http: reqwest::Client,
}

impl DefaultConnector {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl Default for DefaultConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for DefaultConnector {
    async fn open(&self, spec: &UpstreamServerSpec) -> Result<OpenedTransport, UpstreamError> {
        match spec.transport {
            TransportKind::Stdio => stdio::spawn(spec),
            TransportKind::Sse => sse::connect(self.http.clone(), spec).await,
            TransportKind::StreamableHttp => streamable::connect(self.http.clone(), spec),
        }
    }
}

// ─── Request Correlation ─────────────────────────────────────────────────────

/// In-flight requests awaiting a response, keyed by request id.
#[derive(Default)]
pub struct PendingRequests {
    waiters: Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `id`. The entry is removed when the guard drops,
    /// so an abandoned request (deadline expired) leaves nothing behind.
    pub fn register(self: &Arc<Self>, id: u64) -> PendingGuard {
        let (tx, rx) = oneshot::channel();
        if let Ok(mut waiters) = self.waiters.lock() {
            waiters.insert(id, tx);
        }
        PendingGuard {
            id,
            rx: Some(rx),
            pending: Arc::clone(self),
        }
    }

    /// Deliver a response to its waiter. Responses nobody waits for any more
    /// (late stragglers after a timeout) go to the discard sink.
    pub fn resolve(&self, server: &str, response: JsonRpcResponse) {
        let waiter = self
            .waiters
            .lock()
            .ok()
            .and_then(|mut waiters| waiters.remove(&response.id));
        match waiter {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => {
                tracing::debug!(server, id = response.id, "discarding late or unknown response");
            }
        }
    }

    /// Drop every waiter; each pending `wait` then fails with a transport error.
    pub fn fail_all(&self) {
        if let Ok(mut waiters) = self.waiters.lock() {
            waiters.clear();
        }
    }

    /// Number of requests currently awaiting a response.
    pub fn len(&self) -> usize {
        self.waiters.lock().map(|w| w.len()).unwrap_or(0)
    }

    /// Whether nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn forget(&self, id: u64) {
        if let Ok(mut waiters) = self.waiters.lock() {
            waiters.remove(&id);
        }
    }
}

/// Handle for one in-flight request.
pub struct PendingGuard {
    id: u64,
    rx: Option<oneshot::Receiver<JsonRpcResponse>>,
    pending: Arc<PendingRequests>,
}

impl PendingGuard {
    /// Wait for the correlated response.
    pub async fn wait(mut self, server: &str) -> Result<JsonRpcResponse, UpstreamError> {
        let rx = self.rx.take().ok_or_else(|| UpstreamError::TransportError {
            server: server.to_string(),
            reason: "response already consumed".into(),
        })?;
        rx.await.map_err(|_| UpstreamError::TransportError {
            server: server.to_string(),
            reason: "channel closed before the response arrived".into(),
        })
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.forget(self.id);
    }
}

// ─── Message Classification ──────────────────────────────────────────────────

/// One inbound JSON-RPC message, classified.
#[derive(Debug)]
pub enum Incoming {
    /// Response to one of our requests.
    Response(JsonRpcResponse),
    /// Server-initiated notification.
    Notification(ServerNotification),
    /// Server-initiated request (e.g. `ping`) that needs an answer.
    Request {
        id: serde_json::Value,
        method: String,
    },
    /// Anything else (log noise, malformed JSON).
    Ignored,
}

/// Classify a raw JSON-RPC value.
pub fn classify(value: serde_json::Value) -> Incoming {
    let method = value
        .get("method")
        .and_then(|m| m.as_str())
        .map(String::from);
    let id = value.get("id").filter(|id| !id.is_null()).cloned();

    match (method, id) {
        (Some(method), Some(id)) => Incoming::Request { id, method },
        (Some(method), None) => Incoming::Notification(ServerNotification {
            method,
            params: value.get("params").cloned(),
        }),
        (None, Some(_)) => match serde_json::from_value::<JsonRpcResponse>(value) {
            Ok(resp) => Incoming::Response(resp),
            Err(_) => Incoming::Ignored,
        },
        (None, None) => Incoming::Ignored,
    }
}

/// Classify a text frame, which may hold a single message or a batch.
pub fn classify_text(text: &str) -> Vec<Incoming> {
    match serde_json::from_str::<serde_json::Value>(text.trim()) {
        Ok(serde_json::Value::Array(items)) => items.into_iter().map(classify).collect(),
        Ok(value) => vec![classify(value)],
        Err(_) => vec![Incoming::Ignored],
    }
}

/// Build the reply to a server-initiated request.
///
/// The hub answers `ping`; everything else is politely refused.
pub fn reply_to_server_request(id: serde_json::Value, method: &str) -> serde_json::Value {
    if method == methods::PING {
        serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": {} })
    } else {
        serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {
                "code": error_codes::METHOD_NOT_FOUND,
                "message": format!("method '{method}' is not supported by the hub"),
            }
        })
    }
}

/// Serialize a JSON-RPC notification.
pub fn notification_body(method: &str, params: Option<serde_json::Value>) -> serde_json::Value {
    match params {
        Some(params) => serde_json::json!({ "jsonrpc": "2.0", "method": method, "params": params }),
        None => serde_json::json!({ "jsonrpc": "2.0", "method": method }),
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `UpstreamError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, UpstreamError> {
    if let Some(err) = response.error {
        return Err(UpstreamError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(UpstreamError::ServerError {
        code: error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn response(id: u64) -> JsonRpcResponse {
        JsonRpcResponse {
            id,
            result: Some(serde_json::json!({"ok": true})),
            error: None,
        }
    }

    #[test]
    fn test_next_request_id_is_monotonic() {
        let id1 = next_request_id();
        let id2 = next_request_id();
        assert!(id2 > id1);
    }

    #[tokio::test]
    async fn test_pending_routes_by_id() {
        let pending = Arc::new(PendingRequests::new());
        let first = pending.register(10);
        let second = pending.register(11);

        pending.resolve("srv", response(11));
        pending.resolve("srv", response(10));

        assert_eq!(second.wait("srv").await.unwrap().id, 11);
        assert_eq!(first.wait("srv").await.unwrap().id, 10);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_guard_discards_late_response() {
        let pending = Arc::new(PendingRequests::new());
        let guard = pending.register(7);
        drop(guard);
        assert!(pending.is_empty());
        // Late straggler goes to the discard sink without panicking.
        pending.resolve("srv", response(7));
    }

    #[tokio::test]
    async fn test_fail_all_surfaces_transport_error() {
        let pending = Arc::new(PendingRequests::new());
        let guard = pending.register(3);
        pending.fail_all();
        let err = guard.wait("srv").await.unwrap_err();
        assert!(matches!(err, UpstreamError::TransportError { .. }));
    }

    #[test]
    fn test_classify_message_shapes() {
        let resp = classify(serde_json::json!({"jsonrpc": "2.0", "id": 4, "result": {}}));
        assert!(matches!(resp, Incoming::Response(r) if r.id == 4));

        let notif = classify(serde_json::json!({
            "jsonrpc": "2.0",
            "method": "notifications/tools/list_changed"
        }));
        assert!(matches!(notif, Incoming::Notification(n) if n.is_list_changed()));

        let req = classify(serde_json::json!({"jsonrpc": "2.0", "id": "a", "method": "ping"}));
        assert!(matches!(req, Incoming::Request { method, .. } if method == "ping"));

        let noise = classify(serde_json::json!({"hello": "world"}));
        assert!(matches!(noise, Incoming::Ignored));
    }

    #[test]
    fn test_classify_text_batch_and_noise() {
        let batch = classify_text(r#"[{"jsonrpc":"2.0","id":1,"result":{}},{"jsonrpc":"2.0","method":"x"}]"#);
        assert_eq!(batch.len(), 2);
        let noise = classify_text("Server listening on stdio");
        assert!(matches!(noise[0], Incoming::Ignored));
    }

    #[test]
    fn test_reply_to_ping_and_unknown() {
        let pong = reply_to_server_request(serde_json::json!(9), "ping");
        assert_eq!(pong["id"], 9);
        assert!(pong.get("result").is_some());

        let refused = reply_to_server_request(serde_json::json!(9), "sampling/createMessage");
        assert_eq!(refused["error"]["code"], error_codes::METHOD_NOT_FOUND);
    }

    #[test]
    fn test_extract_result_error() {
        let resp = JsonRpcResponse {
            id: 1,
            result: None,
            error: Some(super::super::types::JsonRpcError {
                code: -32601,
                message: "Method not found".into(),
                data: None,
            }),
        };
        match extract_result(resp).unwrap_err() {
            UpstreamError::ServerError { code, message, .. } => {
                assert_eq!(code, -32601);
                assert_eq!(message, "Method not found");
            }
            other => panic!("expected ServerError, got {other:?}"),
        }
    }

    #[test]
    fn test_extract_result_missing_both() {
        let resp = JsonRpcResponse {
            id: 1,
            result: None,
            error: None,
        };
        assert!(matches!(
            extract_result(resp).unwrap_err(),
            UpstreamError::ServerError { .. }
        ));
    }
}
