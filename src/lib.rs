//! ToolHub: one endpoint in front of many MCP servers.
//!
//! The hub keeps a connection to every configured upstream server (stdio,
//! SSE or streamable HTTP), publishes their tools, prompts and resources
//! into a namespaced [`registry`], and routes calls back to the owning
//! server through the [`dispatch`] layer. The optional [`smart`] layer
//! ranks capabilities against a free-text query.
//!
//! [`Hub`] wires these together; [`run`] is the binary's entry point.

pub mod config;
pub mod dispatch;
pub mod hub;
pub mod registry;
pub mod smart;
pub mod upstream;

#[cfg(test)]
mod testing;

use tracing_subscriber::fmt::writer::BoxMakeWriter;

pub use hub::Hub;

/// Environment variable holding the log filter; `RUST_LOG` is the fallback.
const LOG_ENV: &str = "TOOLHUB_LOG";
/// Set to `json` for JSON log lines.
const LOG_FORMAT_ENV: &str = "TOOLHUB_LOG_FORMAT";
const DEFAULT_LOG_FILTER: &str = "toolhub=info,warn";

/// Return the platform-standard data directory for ToolHub.
///
/// - macOS: `~/Library/Application Support/toolhub/`
/// - Windows: `{FOLDERID_RoamingAppData}\toolhub\`
/// - Linux: `$XDG_DATA_HOME/toolhub/` (fallback `~/.local/share/toolhub/`)
///
/// Falls back to `~/.toolhub/` only if none of the above can be resolved.
pub fn data_dir() -> std::path::PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("toolhub");
    }
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".toolhub")
}

/// Boot the hub from its config file and serve until ctrl-c.
pub async fn run() -> anyhow::Result<()> {
    let dir = data_dir();
    init_tracing(&dir);

    let path = config::find_config_path(&dir)?;
    let hub_config = config::load_config(&path)?;
    tracing::info!(
        path = %path.display(),
        servers = hub_config.servers.len(),
        groups = hub_config.groups.len(),
        smart = hub_config.settings.smart.enabled,
        "configuration loaded"
    );

    let hub = Hub::with_default_stack(&hub_config.settings)?;
    for status in hub.start(hub_config).await {
        match &status.last_error {
            Some(error) => tracing::warn!(
                server = %status.name,
                state = %status.state,
                error = %error,
                "server not connected"
            ),
            None => tracing::info!(
                server = %status.name,
                state = %status.state,
                tools = status.tool_count,
                prompts = status.prompt_count,
                resources = status.resource_count,
                "server ready"
            ),
        }
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    hub.shutdown().await;
    Ok(())
}

/// Initialize the tracing subscriber, writing structured logs to the data
/// directory.
///
/// On each startup:
/// 1. Rotates existing logs (hub.log → hub.log.1 → .2 → .3, keeps last 3).
/// 2. Opens a fresh hub.log with a line-flushing writer. If it cannot be
///    opened, logs go to stderr.
/// 3. Logs a startup banner with the data directory path.
fn init_tracing(log_dir: &std::path::Path) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let _ = std::fs::create_dir_all(log_dir);
    let log_path = log_dir.join("hub.log");
    rotate_log_file(&log_path, 3);

    let writer = match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
    {
        Ok(file) => BoxMakeWriter::new(FlushingWriter::new(file)),
        Err(e) => {
            eprintln!("toolhub: cannot open {}: {e}; logging to stderr", log_path.display());
            BoxMakeWriter::new(std::io::stderr)
        }
    };

    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false);

    let json = std::env::var(LOG_FORMAT_ENV).is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(e) = installed {
        eprintln!("toolhub: tracing already initialized: {e}");
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %log_dir.display(),
        log_file = %log_path.display(),
        pid = std::process::id(),
        "=== ToolHub starting ==="
    );
}

/// Rotate log files: `hub.log` → `hub.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &std::path::Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    // Shift: .{n-1} → .{n}
    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write, so
/// each log line is on disk even if the process dies.
#[derive(Clone)]
struct FlushingWriter {
    file: std::sync::Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: std::sync::Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
