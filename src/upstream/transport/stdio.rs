//! JSON-RPC over stdio transport.
//!
//! Handles low-level communication with MCP server child processes:
//! - Writing JSON-RPC requests to stdin (one JSON object per line)
//! - A reader task that routes stdout lines to waiting requests by id
//! - Forwarding server notifications on a separate channel
//! - Keeping a short stderr tail for diagnostics

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{
    classify_text, next_request_id, notification_body, reply_to_server_request, Incoming,
    OpenedTransport, PendingGuard, PendingRequests, Transport,
};
use crate::upstream::errors::UpstreamError;
use crate::upstream::types::{JsonRpcRequest, JsonRpcResponse, ServerNotification, UpstreamServerSpec};

/// Grace period for a process to exit after stdin closes.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Number of stderr lines retained for diagnostics.
const STDERR_TAIL_LINES: usize = 20;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

// ─── Transport ───────────────────────────────────────────────────────────────

/// Bi-directional JSON-RPC transport over a child process's stdio.
pub struct StdioTransport {
    server_name: String,
    writer: Arc<tokio::sync::Mutex<BoxedWriter>>,
    pending: Arc<PendingRequests>,
    closed: Arc<AtomicBool>,
    child: Mutex<Option<Child>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
}

/// Spawn the server process described by `spec` and wire its stdio.
pub fn spawn(spec: &UpstreamServerSpec) -> Result<OpenedTransport, UpstreamError> {
    let command = spec.command.as_deref().ok_or_else(|| UpstreamError::SpawnFailed {
        name: spec.name.clone(),
        reason: "no command configured".into(),
    })?;

    let mut cmd = Command::new(command);
    cmd.args(&spec.args);
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }
    if let Some(dir) = spec.cwd.as_deref() {
        cmd.current_dir(dir);
    }

    // Windows: prevent console window from appearing for child processes
    #[cfg(target_os = "windows")]
    {
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd.stdin(std::process::Stdio::piped());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| UpstreamError::SpawnFailed {
        name: spec.name.clone(),
        reason: format!("{e}"),
    })?;

    let stdin = child.stdin.take().ok_or(UpstreamError::SpawnFailed {
        name: spec.name.clone(),
        reason: "failed to capture stdin".into(),
    })?;
    let stdout = child.stdout.take().ok_or(UpstreamError::SpawnFailed {
        name: spec.name.clone(),
        reason: "failed to capture stdout".into(),
    })?;
    let stderr = child.stderr.take();

    tracing::debug!(server = %spec.name, command, pid = child.id(), "spawned stdio server");

    let opened = StdioTransport::from_io(&spec.name, stdout, stdin, Some(child), stderr);
    Ok(opened)
}

impl StdioTransport {
    /// Build a transport over arbitrary reader/writer halves.
    ///
    /// `spawn` uses this with a child's pipes; tests use in-memory duplex streams.
    pub fn from_io<R, W, E>(
        server_name: &str,
        reader: R,
        writer: W,
        child: Option<Child>,
        stderr: Option<E>,
    ) -> OpenedTransport
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
        E: AsyncRead + Send + Unpin + 'static,
    {
        let (notif_tx, notif_rx) = mpsc::unbounded_channel();
        let writer: Arc<tokio::sync::Mutex<BoxedWriter>> =
            Arc::new(tokio::sync::Mutex::new(Box::new(writer)));
        let pending = Arc::new(PendingRequests::new());
        let closed = Arc::new(AtomicBool::new(false));
        let stderr_tail = Arc::new(Mutex::new(VecDeque::new()));

        let mut tasks = vec![tokio::spawn(read_loop(
            server_name.to_string(),
            reader,
            Arc::clone(&writer),
            Arc::clone(&pending),
            Arc::clone(&closed),
            notif_tx,
        ))];
        if let Some(stderr) = stderr {
            tasks.push(tokio::spawn(stderr_loop(
                server_name.to_string(),
                stderr,
                Arc::clone(&stderr_tail),
            )));
        }

        let transport = Self {
            server_name: server_name.to_string(),
            writer,
            pending,
            closed,
            child: Mutex::new(child),
            tasks: Mutex::new(tasks),
            stderr_tail,
        };

        OpenedTransport {
            transport: Arc::new(transport),
            notifications: notif_rx,
        }
    }

    fn closed_error(&self) -> UpstreamError {
        UpstreamError::TransportError {
            server: self.server_name.clone(),
            reason: "server stdout closed (process may have exited)".into(),
        }
    }

    /// Register a waiter for `id`, unless the transport closed in the meantime.
    ///
    /// A close that ran `fail_all` before the entry went in would otherwise
    /// leave the request waiting on a sender nobody will ever drop.
    fn register_open(&self, id: u64) -> Result<PendingGuard, UpstreamError> {
        let guard = self.pending.register(id);
        if self.is_closed() {
            drop(guard);
            return Err(self.closed_error());
        }
        Ok(guard)
    }
}

#[async_trait]
impl Transport for StdioTransport {
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
        let req = JsonRpcRequest::new(id, method, params);
        let body = serde_json::to_value(&req).map_err(|e| UpstreamError::TransportError {
            server: self.server_name.clone(),
            reason: format!("failed to serialize request: {e}"),
        })?;

        let guard = self.register_open(id)?;
        if let Err(e) = write_message(&self.writer, &self.server_name, &body).await {
            self.closed.store(true, Ordering::SeqCst);
            return Err(e);
        }
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
        write_message(
            &self.writer,
            &self.server_name,
            &notification_body(method, params),
        )
        .await
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            // Already closed once; still make sure the process is gone.
            if let Some(mut child) = self.child.lock().ok().and_then(|mut c| c.take()) {
                let _ = child.kill().await;
            }
            return;
        }
        self.pending.fail_all();

        // Closing stdin is the conventional stdio shutdown signal.
        {
            let mut writer = self.writer.lock().await;
            let _ = writer.shutdown().await;
        }

        let child = self.child.lock().ok().and_then(|mut c| c.take());
        if let Some(mut child) = child {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!(server = %self.server_name, %status, "server process exited");
                }
                _ => {
                    let _ = child.kill().await;
                    tracing::debug!(server = %self.server_name, "server process killed");
                }
            }
        }

        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn diagnostics(&self) -> Option<String> {
        let tail = self.stderr_tail.lock().ok()?;
        if tail.is_empty() {
            return None;
        }
        Some(tail.iter().cloned().collect::<Vec<_>>().join("\n"))
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

// ─── Tasks ───────────────────────────────────────────────────────────────────

/// Write one message as a single line and flush.
async fn write_message(
    writer: &tokio::sync::Mutex<BoxedWriter>,
    server: &str,
    message: &serde_json::Value,
) -> Result<(), UpstreamError> {
    let mut line = message.to_string();
    line.push('\n');

    let mut writer = writer.lock().await;
    writer
        .write_all(line.as_bytes())
        .await
        .map_err(|e| UpstreamError::TransportError {
            server: server.to_string(),
            reason: format!("failed to write to stdin: {e}"),
        })?;
    writer
        .flush()
        .await
        .map_err(|e| UpstreamError::TransportError {
            server: server.to_string(),
            reason: format!("failed to flush stdin: {e}"),
        })
}

/// Route stdout lines until EOF, then mark the channel lost.
async fn read_loop<R>(
    server: String,
    reader: R,
    writer: Arc<tokio::sync::Mutex<BoxedWriter>>,
    pending: Arc<PendingRequests>,
    closed: Arc<AtomicBool>,
    notifications: mpsc::UnboundedSender<ServerNotification>,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut lines = BufReader::new(reader).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                for message in classify_text(&line) {
                    match message {
                        Incoming::Response(resp) => pending.resolve(&server, resp),
                        Incoming::Notification(n) => {
                            let _ = notifications.send(n);
                        }
                        Incoming::Request { id, method } => {
                            let reply = reply_to_server_request(id, &method);
                            if let Err(e) = write_message(&writer, &server, &reply).await {
                                tracing::debug!(server = %server, error = %e, "failed to answer server request");
                            }
                        }
                        // Not JSON-RPC; usually server log output on stdout.
                        Incoming::Ignored => {
                            tracing::trace!(server = %server, line = %line, "ignoring non-protocol output");
                        }
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(server = %server, error = %e, "stdout read failed");
                break;
            }
        }
    }

    closed.store(true, Ordering::SeqCst);
    pending.fail_all();
    tracing::debug!(server = %server, "stdout reader finished");
}

/// Keep the last few stderr lines and mirror them to the debug log.
async fn stderr_loop<E>(server: String, stderr: E, tail: Arc<Mutex<VecDeque<String>>>)
where
    E: AsyncRead + Send + Unpin + 'static,
{
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(server = %server, stderr = %line, "server stderr");
        if let Ok(mut tail) = tail.lock() {
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
