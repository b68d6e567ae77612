//! Config file discovery, loading, and validation.
//!
//! Reads `hub.yaml` and resolves `${VAR}` / `${VAR:-default}` references
//! before parsing, so secrets such as bearer tokens can stay in the
//! environment.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::errors::ConfigError;
use super::settings::HubSettings;
use crate::registry::{Group, NAMESPACE_SEPARATOR};
use crate::upstream::types::{TransportKind, UpstreamServerSpec};

/// Env var that overrides the config location.
pub const CONFIG_ENV: &str = "TOOLHUB_CONFIG";

/// File name looked up in the data directory.
pub const CONFIG_FILE_NAME: &str = "hub.yaml";

// ─── Public Types ────────────────────────────────────────────────────────────

/// Everything the hub is configured with.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Upstream servers, in declaration order.
    pub servers: Vec<UpstreamServerSpec>,
    pub groups: Vec<Group>,
    pub settings: HubSettings,
}

impl HubConfig {
    pub fn server(&self, name: &str) -> Option<&UpstreamServerSpec> {
        self.servers.iter().find(|s| s.name == name)
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate the config file.
///
/// `TOOLHUB_CONFIG` wins when set; otherwise `<data_dir>/hub.yaml`.
pub fn find_config_path(data_dir: &Path) -> Result<PathBuf, ConfigError> {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        let candidate = PathBuf::from(expand_tilde(&path));
        if candidate.exists() {
            return Ok(candidate);
        }
        return Err(ConfigError::NotFound {
            reason: format!("{CONFIG_ENV} points at {}, which does not exist", candidate.display()),
        });
    }

    let candidate = data_dir.join(CONFIG_FILE_NAME);
    if candidate.exists() {
        return Ok(candidate);
    }

    Err(ConfigError::NotFound {
        reason: format!("no {CONFIG_FILE_NAME} in {}", data_dir.display()),
    })
}

/// Load, interpolate, parse, and validate a config file.
pub fn load_config(path: &Path) -> Result<HubConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFailed {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    parse_config(&raw)
}

/// Parse and validate config text.
pub fn parse_config(raw: &str) -> Result<HubConfig, ConfigError> {
    let interpolated = interpolate_env_vars(raw);
    let config: HubConfig =
        serde_yaml::from_str(&interpolated).map_err(|e| ConfigError::ParseFailed {
            reason: e.to_string(),
        })?;
    validate(&config)?;
    Ok(config)
}

// ─── Validation ──────────────────────────────────────────────────────────────

/// Check names, transport parameters, groups, and settings ranges.
pub fn validate(config: &HubConfig) -> Result<(), ConfigError> {
    let mut names = HashSet::new();
    for spec in &config.servers {
        validate_server(spec)?;
        if !names.insert(spec.name.as_str()) {
            return Err(ConfigError::DuplicateServer {
                name: spec.name.clone(),
            });
        }
    }

    let mut group_names = HashSet::new();
    for group in &config.groups {
        if group.name.trim().is_empty() {
            return Err(ConfigError::InvalidGroup {
                name: group.name.clone(),
                reason: "name must not be empty".into(),
            });
        }
        if !group_names.insert(group.name.as_str()) {
            return Err(ConfigError::InvalidGroup {
                name: group.name.clone(),
                reason: "duplicate group name".into(),
            });
        }
    }

    validate_settings(&config.settings)
}

/// Validate one server definition.
pub fn validate_server(spec: &UpstreamServerSpec) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidServer {
        name: spec.name.clone(),
        reason: reason.to_string(),
    };

    if spec.name.trim().is_empty() {
        return Err(invalid("name must not be empty"));
    }
    if spec.name.contains(NAMESPACE_SEPARATOR) {
        return Err(invalid(&format!(
            "name must not contain the namespace separator '{NAMESPACE_SEPARATOR}'"
        )));
    }

    match spec.transport {
        TransportKind::Stdio => {
            if spec.command.as_deref().map_or(true, |c| c.trim().is_empty()) {
                return Err(invalid("stdio servers need a command"));
            }
        }
        TransportKind::Sse | TransportKind::StreamableHttp => {
            let raw = spec
                .url
                .as_deref()
                .ok_or_else(|| invalid("network servers need a url"))?;
            let url = url::Url::parse(raw).map_err(|e| invalid(&format!("invalid url: {e}")))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(invalid("url scheme must be http or https"));
            }
        }
    }
    Ok(())
}

fn validate_settings(settings: &HubSettings) -> Result<(), ConfigError> {
    let invalid = |field: &str, reason: String| ConfigError::InvalidSetting {
        field: field.to_string(),
        reason,
    };

    let backoff = &settings.supervisor.backoff;
    if !(0.0..0.5).contains(&backoff.jitter) {
        return Err(invalid(
            "supervisor.backoff.jitter",
            format!("{} is outside [0, 0.5)", backoff.jitter),
        ));
    }
    if backoff.base_ms == 0 {
        return Err(invalid("supervisor.backoff.base_ms", "must be positive".into()));
    }
    if backoff.cap_ms < backoff.base_ms {
        return Err(invalid(
            "supervisor.backoff.cap_ms",
            format!("{} is below base_ms {}", backoff.cap_ms, backoff.base_ms),
        ));
    }
    if settings.supervisor.max_concurrent_starts == 0 {
        return Err(invalid("supervisor.max_concurrent_starts", "must be positive".into()));
    }

    let relevance = settings.smart.min_relevance;
    if !(-1.0..=1.0).contains(&relevance) {
        return Err(invalid(
            "smart.min_relevance",
            format!("{relevance} is outside [-1, 1]"),
        ));
    }
    if settings.smart.top_k == 0 {
        return Err(invalid("smart.top_k", "must be positive".into()));
    }
    Ok(())
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                expr.push(c);
            }
            result.push_str(&resolve_var_expr(&expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => std::env::var(name).unwrap_or_else(|_| expand_tilde(default)),
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ToolFilter;

    const SAMPLE: &str = r#"
servers:
  - name: fs
    command: npx
    args: ["-y", "@modelcontextprotocol/server-filesystem", "/tmp"]
  - name: remote
    transport: streamable_http
    url: https://example.com/mcp
    headers:
      Authorization: "Bearer ${__TOOLHUB_TEST_TOKEN__:-none}"
    owner: alice
groups:
  - name: G
    members:
      - { server: fs, tools: [read_file] }
      - { server: remote, tools: all }
settings:
  dispatch:
    call_timeout_ms: 1000
"#;

    #[test]
    fn test_parse_sample_config() {
        std::env::remove_var("__TOOLHUB_TEST_TOKEN__");
        let config = parse_config(SAMPLE).unwrap();
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.servers[1].transport, TransportKind::StreamableHttp);
        assert_eq!(config.servers[1].headers["Authorization"], "Bearer none");
        assert_eq!(config.servers[1].owner, "alice");

        let group = &config.groups[0];
        assert_eq!(group.members[0].tools, ToolFilter::List(vec!["read_file".into()]));
        assert_eq!(group.members[1].tools, ToolFilter::All);
        assert_eq!(config.settings.dispatch.call_timeout_ms, 1000);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, SAMPLE).unwrap();
        let config = load_config(&path).unwrap();
        assert!(config.server("fs").is_some());
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(&dir.path().join("nope.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadFailed { .. }));
    }

    #[test]
    fn test_duplicate_server_rejected() {
        let yaml = "servers:\n  - { name: a, command: x }\n  - { name: a, command: y }\n";
        assert!(matches!(
            parse_config(yaml).unwrap_err(),
            ConfigError::DuplicateServer { .. }
        ));
    }

    #[test]
    fn test_separator_in_name_rejected() {
        let yaml = "servers:\n  - { name: a__b, command: x }\n";
        assert!(matches!(
            parse_config(yaml).unwrap_err(),
            ConfigError::InvalidServer { .. }
        ));
    }

    #[test]
    fn test_transport_parameters_required() {
        let no_command = "servers:\n  - { name: a }\n";
        assert!(parse_config(no_command).is_err());

        let bad_scheme = "servers:\n  - { name: a, transport: sse, url: 'ftp://host/x' }\n";
        assert!(parse_config(bad_scheme).is_err());
    }

    #[test]
    fn test_settings_ranges() {
        let jitter = "settings:\n  supervisor:\n    backoff: { jitter: 0.5 }\n";
        assert!(matches!(
            parse_config(jitter).unwrap_err(),
            ConfigError::InvalidSetting { .. }
        ));

        let cap = "settings:\n  supervisor:\n    backoff: { base_ms: 500, cap_ms: 100 }\n";
        assert!(parse_config(cap).is_err());

        let relevance = "settings:\n  smart: { min_relevance: 1.5 }\n";
        assert!(parse_config(relevance).is_err());
    }

    #[test]
    fn test_empty_config_is_valid() {
        let config = parse_config("{}").unwrap();
        assert!(config.servers.is_empty());
        assert_eq!(config.settings, HubSettings::default());
    }

    #[test]
    fn test_interpolation() {
        std::env::set_var("__TOOLHUB_TEST_VAR__", "value");
        assert_eq!(interpolate_env_vars("a ${__TOOLHUB_TEST_VAR__} b"), "a value b");
        std::env::remove_var("__TOOLHUB_TEST_VAR__");
        assert_eq!(interpolate_env_vars("${__TOOLHUB_TEST_VAR__:-x}"), "x");
        assert_eq!(interpolate_env_vars("plain"), "plain");
    }

    #[test]
    fn test_find_config_in_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "{}").unwrap();
        if std::env::var(CONFIG_ENV).is_err() {
            assert_eq!(
                find_config_path(dir.path()).unwrap(),
                dir.path().join(CONFIG_FILE_NAME)
            );
        }
    }
}
