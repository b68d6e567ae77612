//! Streamable HTTP transport.
//!
//! Every client message is a `POST` to the server URL. The reply is either a
//! JSON body, an SSE stream carrying one or more messages, or `202 Accepted`
//! with no body. The server may assign a session via `Mcp-Session-Id`, which
//! is echoed on every later request. After the handshake an optional `GET`
//! stream delivers server-initiated notifications.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::sse_parser::pump;
use super::{
    classify_text, next_request_id, notification_body, reply_to_server_request, Incoming,
    OpenedTransport, PendingRequests, Transport,
};
use crate::upstream::errors::UpstreamError;
use crate::upstream::types::{JsonRpcRequest, JsonRpcResponse, ServerNotification, UpstreamServerSpec};

const SESSION_HEADER: &str = "mcp-session-id";
const DELETE_TIMEOUT: Duration = Duration::from_secs(2);

/// Shape of a POST reply body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyKind {
    Json,
    EventStream,
    Empty,
}

fn body_kind(status: StatusCode, headers: &HeaderMap) -> BodyKind {
    if status == StatusCode::ACCEPTED || status == StatusCode::NO_CONTENT {
        return BodyKind::Empty;
    }
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();
    if content_type.starts_with("text/event-stream") {
        BodyKind::EventStream
    } else {
        BodyKind::Json
    }
}

// ─── Shared State ────────────────────────────────────────────────────────────

/// State reachable from both the transport and its background stream tasks.
struct Shared {
    server: String,
    http: reqwest::Client,
    endpoint: url::Url,
    headers: Vec<(String, String)>,
    session_id: Mutex<Option<String>>,
    pending: Arc<PendingRequests>,
    notifications: Mutex<Option<mpsc::UnboundedSender<ServerNotification>>>,
    closed: AtomicBool,
}

impl Shared {
    fn session(&self) -> Option<String> {
        self.session_id.lock().ok().and_then(|s| s.clone())
    }

    fn remember_session(&self, headers: &HeaderMap) {
        let Some(id) = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) else {
            return;
        };
        if let Ok(mut session) = self.session_id.lock() {
            if session.as_deref() != Some(id) {
                tracing::debug!(server = %self.server, session = id, "session assigned");
                *session = Some(id.to_string());
            }
        }
    }

    fn builder(&self, method: reqwest::Method) -> reqwest::RequestBuilder {
        let mut request = self.http.request(method, self.endpoint.clone());
        for (key, value) in &self.headers {
            request = request.header(key.as_str(), value.as_str());
        }
        if let Some(session) = self.session() {
            request = request.header(SESSION_HEADER, session);
        }
        request
    }

    fn transport_error(&self, reason: impl Into<String>) -> UpstreamError {
        UpstreamError::TransportError {
            server: self.server.clone(),
            reason: reason.into(),
        }
    }

    /// Mark the channel lost: pending waiters fail and the notification
    /// stream closes so the owning connection notices.
    fn mark_lost(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.pending.fail_all();
        if let Ok(mut tx) = self.notifications.lock() {
            tx.take();
        }
    }

    /// POST one message and check the status line.
    async fn post(&self, body: &serde_json::Value) -> Result<reqwest::Response, UpstreamError> {
        let response = self
            .builder(reqwest::Method::POST)
            .header(ACCEPT, "application/json, text/event-stream")
            .json(body)
            .send()
            .await
            .map_err(|e| self.transport_error(format!("POST {}: {e}", self.endpoint)))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND && self.session().is_some() {
            self.mark_lost();
            return Err(self.transport_error("session expired (HTTP 404)"));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(self.transport_error(format!("HTTP {}: {text}", status.as_u16())));
        }
        self.remember_session(response.headers());
        Ok(response)
    }

    fn route_text(self: &Arc<Self>, text: &str) {
        for message in classify_text(text) {
            self.route(message);
        }
    }

    fn route(self: &Arc<Self>, message: Incoming) {
        match message {
            Incoming::Response(resp) => self.pending.resolve(&self.server, resp),
            Incoming::Notification(n) => {
                let tx = self.notifications.lock().ok().and_then(|tx| tx.clone());
                if let Some(tx) = tx {
                    let _ = tx.send(n);
                }
            }
            Incoming::Request { id, method } => {
                let shared = Arc::clone(self);
                let reply = reply_to_server_request(id, &method);
                tokio::spawn(async move {
                    if let Err(e) = shared.post(&reply).await {
                        tracing::debug!(server = %shared.server, error = %e, "failed to answer server request");
                    }
                });
            }
            Incoming::Ignored => {}
        }
    }

    /// Consume a POST reply. SSE bodies are drained on a background task so
    /// the caller can await its own response through the pending table.
    async fn absorb(
        self: &Arc<Self>,
        response: reqwest::Response,
    ) -> Result<Option<JoinHandle<()>>, UpstreamError> {
        match body_kind(response.status(), response.headers()) {
            BodyKind::Empty => Ok(None),
            BodyKind::Json => {
                let text = response
                    .text()
                    .await
                    .map_err(|e| self.transport_error(format!("failed to read body: {e}")))?;
                if !text.trim().is_empty() {
                    self.route_text(&text);
                }
                Ok(None)
            }
            BodyKind::EventStream => {
                let shared = Arc::clone(self);
                Ok(Some(tokio::spawn(async move {
                    let result = pump(response.bytes_stream(), |event| {
                        shared.route_text(&event.data);
                        true
                    })
                    .await;
                    if let Err(reason) = result {
                        tracing::debug!(server = %shared.server, reason = %reason, "response stream ended early");
                    }
                })))
            }
        }
    }
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// JSON-RPC transport over streamable HTTP.
pub struct StreamableTransport {
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Prepare a streamable HTTP transport. No traffic happens until the first
/// request, so connection failures surface from the handshake.
pub fn connect(
    http: reqwest::Client,
    spec: &UpstreamServerSpec,
) -> Result<OpenedTransport, UpstreamError> {
    let connect_err = |reason: String| UpstreamError::ConnectFailed {
        name: spec.name.clone(),
        reason,
    };
    let raw_url = spec
        .url
        .as_deref()
        .ok_or_else(|| connect_err("no url configured".into()))?;
    let endpoint = url::Url::parse(raw_url).map_err(|e| connect_err(format!("invalid url: {e}")))?;

    let (notif_tx, notif_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        server: spec.name.clone(),
        http,
        endpoint,
        headers: spec
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        session_id: Mutex::new(None),
        pending: Arc::new(PendingRequests::new()),
        notifications: Mutex::new(Some(notif_tx)),
        closed: AtomicBool::new(false),
    });

    Ok(OpenedTransport {
        transport: Arc::new(StreamableTransport {
            shared,
            tasks: Mutex::new(Vec::new()),
        }),
        notifications: notif_rx,
    })
}

impl StreamableTransport {
    fn track(&self, handle: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.retain(|t| !t.is_finished());
            tasks.push(handle);
        }
    }

    fn abort_tasks(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

#[async_trait]
impl Transport for StreamableTransport {
    fn server_name(&self) -> &str {
        &self.shared.server
    }

    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, UpstreamError> {
        if self.is_closed() {
            return Err(self.shared.transport_error("transport closed"));
        }
        let id = next_request_id();
        let body = serde_json::to_value(JsonRpcRequest::new(id, method, params))
            .map_err(|e| self.shared.transport_error(format!("failed to serialize request: {e}")))?;

        let guard = self.shared.pending.register(id);
        if self.is_closed() {
            return Err(self.shared.transport_error("transport closed"));
        }
        let response = self.shared.post(&body).await?;
        if let Some(task) = self.shared.absorb(response).await? {
            self.track(task);
        }
        guard.wait(&self.shared.server).await
    }

    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), UpstreamError> {
        if self.is_closed() {
            return Err(self.shared.transport_error("transport closed"));
        }
        let response = self.shared.post(&notification_body(method, params)).await?;
        if let Some(task) = self.shared.absorb(response).await? {
            self.track(task);
        }
        Ok(())
    }

    async fn on_initialized(&self) {
        let shared = Arc::clone(&self.shared);
        self.track(tokio::spawn(async move {
            let response = match shared
                .builder(reqwest::Method::GET)
                .header(ACCEPT, "text/event-stream")
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    tracing::debug!(server = %shared.server, error = %e, "notification stream unavailable");
                    return;
                }
            };
            if !response.status().is_success()
                || body_kind(response.status(), response.headers()) != BodyKind::EventStream
            {
                tracing::debug!(
                    server = %shared.server,
                    status = response.status().as_u16(),
                    "server offers no notification stream"
                );
                return;
            }
            let result = pump(response.bytes_stream(), |event| {
                shared.route_text(&event.data);
                true
            })
            .await;
            if let Err(reason) = result {
                tracing::debug!(server = %shared.server, reason = %reason, "notification stream ended");
            }
        }));
    }

    async fn close(&self) {
        self.shared.mark_lost();
        self.abort_tasks();

        let session = self.shared.session_id.lock().ok().and_then(|mut s| s.take());
        if let Some(session) = session {
            let mut request = self
                .shared
                .http
                .delete(self.shared.endpoint.clone())
                .header(SESSION_HEADER, session);
            for (key, value) in &self.shared.headers {
                request = request.header(key.as_str(), value.as_str());
            }
            let delete = request.send();
            match tokio::time::timeout(DELETE_TIMEOUT, delete).await {
                Ok(Ok(_)) => tracing::debug!(server = %self.shared.server, "session terminated"),
                Ok(Err(e)) => {
                    tracing::debug!(server = %self.shared.server, error = %e, "session delete failed")
                }
                Err(_) => tracing::debug!(server = %self.shared.server, "session delete timed out"),
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

impl Drop for StreamableTransport {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn opened() -> (Arc<Shared>, OpenedTransport) {
        let spec = UpstreamServerSpec::remote(
            "web",
            crate::upstream::types::TransportKind::StreamableHttp,
            "http://127.0.0.1:1/mcp",
        );
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            server: spec.name.clone(),
            http: reqwest::Client::new(),
            endpoint: url::Url::parse(spec.url.as_deref().unwrap()).unwrap(),
            headers: Vec::new(),
            session_id: Mutex::new(None),
            pending: Arc::new(PendingRequests::new()),
            notifications: Mutex::new(Some(tx)),
            closed: AtomicBool::new(false),
        });
        let transport = StreamableTransport {
            shared: Arc::clone(&shared),
            tasks: Mutex::new(Vec::new()),
        };
        (
            shared,
            OpenedTransport {
                transport: Arc::new(transport),
                notifications: rx,
            },
        )
    }

    #[test]
    fn body_kind_follows_status_and_content_type() {
        let mut headers = HeaderMap::new();
        assert_eq!(body_kind(StatusCode::ACCEPTED, &headers), BodyKind::Empty);

        headers.insert(CONTENT_TYPE, "application/json".parse().unwrap());
        assert_eq!(body_kind(StatusCode::OK, &headers), BodyKind::Json);

        headers.insert(CONTENT_TYPE, "text/event-stream; charset=utf-8".parse().unwrap());
        assert_eq!(body_kind(StatusCode::OK, &headers), BodyKind::EventStream);
    }

    #[test]
    fn session_header_is_remembered() {
        let (shared, _opened) = opened();
        let mut headers = HeaderMap::new();
        headers.insert(SESSION_HEADER, "sess-1".parse().unwrap());
        shared.remember_session(&headers);
        assert_eq!(shared.session().as_deref(), Some("sess-1"));
    }

    #[tokio::test]
    async fn json_bodies_route_to_waiters_and_notifications() {
        let (shared, mut opened) = opened();
        let guard = shared.pending.register(5);

        shared.route_text(
            r#"[{"jsonrpc":"2.0","id":5,"result":{"tools":[]}},
                {"jsonrpc":"2.0","method":"notifications/resources/list_changed"}]"#,
        );

        assert_eq!(guard.wait("web").await.unwrap().id, 5);
        assert!(opened.notifications.recv().await.unwrap().is_list_changed());
    }

    #[tokio::test]
    async fn close_ends_notification_stream() {
        let (_shared, mut opened) = opened();
        opened.transport.close().await;
        assert!(opened.transport.is_closed());
        assert!(opened.notifications.recv().await.is_none());
    }

    #[tokio::test]
    async fn unreachable_server_fails_with_transport_error() {
        let (_shared, opened) = opened();
        let err = opened.transport.request("ping", None).await.unwrap_err();
        assert!(matches!(err, UpstreamError::TransportError { .. }));
    }

    #[test]
    fn connect_rejects_missing_url() {
        let mut spec = UpstreamServerSpec::remote(
            "web",
            crate::upstream::types::TransportKind::StreamableHttp,
            "http://localhost/mcp",
        );
        spec.url = None;
        let err = connect(reqwest::Client::new(), &spec).err().unwrap();
        assert!(matches!(err, UpstreamError::ConnectFailed { .. }));
    }
}
