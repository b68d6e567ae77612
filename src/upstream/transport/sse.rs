//! Legacy HTTP+SSE transport.
//!
//! The client opens a long-lived `GET` event stream. The server's first
//! `endpoint` event names the URL that accepts `POST`ed JSON-RPC messages;
//! responses and notifications come back as `message` events on the stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::sse_parser::{pump, SseEvent};
use super::{
    classify_text, next_request_id, notification_body, reply_to_server_request, Incoming,
    OpenedTransport, PendingRequests, Transport,
};
use crate::upstream::errors::UpstreamError;
use crate::upstream::types::{JsonRpcRequest, JsonRpcResponse, ServerNotification, UpstreamServerSpec};

/// How long to wait for the `endpoint` event after the stream opens.
const ENDPOINT_TIMEOUT: Duration = Duration::from_secs(10);

// ─── Transport ───────────────────────────────────────────────────────────────

/// JSON-RPC transport over a legacy SSE stream plus POST endpoint.
pub struct SseTransport {
    server_name: String,
    http: reqwest::Client,
    headers: Vec<(String, String)>,
    post_url: Arc<OnceLock<url::Url>>,
    pending: Arc<PendingRequests>,
    closed: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

/// Open the event stream and wait for the server to announce its endpoint.
pub async fn connect(
    http: reqwest::Client,
    spec: &UpstreamServerSpec,
) -> Result<OpenedTransport, UpstreamError> {
    connect_within(http, spec, ENDPOINT_TIMEOUT).await
}

async fn connect_within(
    http: reqwest::Client,
    spec: &UpstreamServerSpec,
    endpoint_timeout: Duration,
) -> Result<OpenedTransport, UpstreamError> {
    let connect_err = |reason: String| UpstreamError::ConnectFailed {
        name: spec.name.clone(),
        reason,
    };

    let raw_url = spec
        .url
        .as_deref()
        .ok_or_else(|| connect_err("no url configured".into()))?;
    let stream_url = url::Url::parse(raw_url).map_err(|e| connect_err(format!("invalid url: {e}")))?;
    let headers: Vec<(String, String)> = spec
        .headers
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let mut request = http
        .get(stream_url.clone())
        .header(reqwest::header::ACCEPT, "text/event-stream");
    for (key, value) in &headers {
        request = request.header(key.as_str(), value.as_str());
    }

    let response = request
        .send()
        .await
        .map_err(|e| connect_err(format!("GET {stream_url}: {e}")))?;
    if !response.status().is_success() {
        return Err(connect_err(format!("GET {stream_url}: HTTP {}", response.status())));
    }

    let (notif_tx, notif_rx) = mpsc::unbounded_channel();
    let (endpoint_tx, endpoint_rx) = oneshot::channel();
    let pending = Arc::new(PendingRequests::new());
    let closed = Arc::new(AtomicBool::new(false));
    let post_url = Arc::new(OnceLock::new());

    let reader = tokio::spawn(read_stream(
        StreamContext {
            server: spec.name.clone(),
            base_url: stream_url.clone(),
            http: http.clone(),
            headers: headers.clone(),
            post_url: Arc::clone(&post_url),
            pending: Arc::clone(&pending),
            notifications: notif_tx,
        },
        response,
        endpoint_tx,
        Arc::clone(&closed),
    ));

    let transport = SseTransport {
        server_name: spec.name.clone(),
        http,
        headers,
        post_url,
        pending,
        closed,
        reader: Mutex::new(Some(reader)),
    };

    match tokio::time::timeout(endpoint_timeout, endpoint_rx).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => {
            transport.close().await;
            return Err(connect_err("event stream ended before the endpoint event".into()));
        }
        Err(_) => {
            transport.close().await;
            return Err(connect_err(format!(
                "no endpoint event within {}ms",
                endpoint_timeout.as_millis()
            )));
        }
    }

    tracing::debug!(server = %spec.name, url = %stream_url, "sse stream open");

    Ok(OpenedTransport {
        transport: Arc::new(transport),
        notifications: notif_rx,
    })
}

impl SseTransport {
    async fn post(&self, body: &serde_json::Value) -> Result<(), UpstreamError> {
        let url = self.post_url.get().cloned().ok_or_else(|| UpstreamError::TransportError {
            server: self.server_name.clone(),
            reason: "no message endpoint announced".into(),
        })?;
        post_message(&self.http, &self.headers, url, body)
            .await
            .map_err(|reason| UpstreamError::TransportError {
                server: self.server_name.clone(),
                reason,
            })
    }

    fn closed_error(&self) -> UpstreamError {
        UpstreamError::TransportError {
            server: self.server_name.clone(),
            reason: "event stream closed".into(),
        }
    }
}

#[async_trait]
impl Transport for SseTransport {
    fn server_name(&self) -> &str {
        &self.server_name
    }

    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, UpstreamError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        let id = next_request_id();
        let body = serde_json::to_value(JsonRpcRequest::new(id, method, params)).map_err(|e| {
            UpstreamError::TransportError {
                server: self.server_name.clone(),
                reason: format!("failed to serialize request: {e}"),
            }
        })?;

        let guard = self.pending.register(id);
        if self.is_closed() {
            return Err(self.closed_error());
        }
        self.post(&body).await?;
        guard.wait(&self.server_name).await
    }

    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), UpstreamError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        self.post(&notification_body(method, params)).await
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.pending.fail_all();
        if let Some(reader) = self.reader.lock().ok().and_then(|mut r| r.take()) {
            reader.abort();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.lock().ok().and_then(|mut r| r.take()) {
            reader.abort();
        }
    }
}

// ─── Stream Reader ───────────────────────────────────────────────────────────

/// Everything the reader task needs to route inbound events.
struct StreamContext {
    server: String,
    base_url: url::Url,
    http: reqwest::Client,
    headers: Vec<(String, String)>,
    post_url: Arc<OnceLock<url::Url>>,
    pending: Arc<PendingRequests>,
    notifications: mpsc::UnboundedSender<ServerNotification>,
}

impl StreamContext {
    /// Handle one event. Returns `false` to stop reading.
    fn handle(&self, event: SseEvent, endpoint_tx: &mut Option<oneshot::Sender<()>>) -> bool {
        match event.event.as_str() {
            "endpoint" => {
                match self.base_url.join(event.data.trim()) {
                    Ok(url) => {
                        let _ = self.post_url.set(url);
                        if let Some(tx) = endpoint_tx.take() {
                            let _ = tx.send(());
                        }
                    }
                    Err(e) => {
                        tracing::warn!(server = %self.server, error = %e, "invalid endpoint event");
                    }
                }
                true
            }
            "message" => {
                for message in classify_text(&event.data) {
                    route_message(self, message);
                }
                true
            }
            _ => true,
        }
    }
}

/// Dispatch one classified message from any HTTP-based stream.
fn route_message(ctx: &StreamContext, message: Incoming) {
    match message {
        Incoming::Response(resp) => ctx.pending.resolve(&ctx.server, resp),
        Incoming::Notification(n) => {
            let _ = ctx.notifications.send(n);
        }
        Incoming::Request { id, method } => {
            let Some(url) = ctx.post_url.get().cloned() else {
                return;
            };
            let reply = reply_to_server_request(id, &method);
            let http = ctx.http.clone();
            let headers = ctx.headers.clone();
            let server = ctx.server.clone();
            tokio::spawn(async move {
                if let Err(reason) = post_message(&http, &headers, url, &reply).await {
                    tracing::debug!(server = %server, reason = %reason, "failed to answer server request");
                }
            });
        }
        Incoming::Ignored => {}
    }
}

async fn read_stream(
    ctx: StreamContext,
    response: reqwest::Response,
    endpoint_tx: oneshot::Sender<()>,
    closed: Arc<AtomicBool>,
) {
    let mut endpoint_tx = Some(endpoint_tx);
    let result = pump(response.bytes_stream(), |event| {
        ctx.handle(event, &mut endpoint_tx)
    })
    .await;

    if let Err(reason) = result {
        tracing::warn!(server = %ctx.server, reason = %reason, "sse stream failed");
    }
    closed.store(true, Ordering::SeqCst);
    ctx.pending.fail_all();
    tracing::debug!(server = %ctx.server, "sse stream finished");
}

/// POST one JSON-RPC message to the announced endpoint.
async fn post_message(
    http: &reqwest::Client,
    headers: &[(String, String)],
    url: url::Url,
    body: &serde_json::Value,
) -> Result<(), String> {
    let mut request = http.post(url.clone()).json(body);
    for (key, value) in headers {
        request = request.header(key.as_str(), value.as_str());
    }
    let response = request
        .send()
        .await
        .map_err(|e| format!("POST {url}: {e}"))?;
    if !response.status().is_success() {
        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        return Err(format!("POST {url}: HTTP {status}: {text}"));
    }
    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
