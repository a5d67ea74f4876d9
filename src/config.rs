//! Host configuration loading.
//!
//! Reads `toolhost.yaml` (or the file named by `TOOLHOST_CONFIG`) and
//! resolves `${VAR}` / `${VAR:-default}` references before parsing. Every
//! key is optional; a missing file means defaults throughout.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::mcp_client::discovery::{well_known_sources, ConfigSource, DiscoveryScanner};
use crate::mcp_client::errors::McpError;
use crate::mcp_client::transport::TransportSettings;

/// Env var naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "TOOLHOST_CONFIG";

/// File searched for upward from the working directory.
pub const CONFIG_FILE_NAME: &str = "toolhost.yaml";

// ─── Public Types ────────────────────────────────────────────────────────────

/// When offline servers are re-checked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthCheckMode {
    /// Only when invoked or on an explicit `revalidate_offline()`.
    #[default]
    OnDemand,
    /// On a fixed interval, in the background.
    Periodic,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default)]
    pub mode: HealthCheckMode,
    #[serde(default = "default_health_interval_secs")]
    pub interval_secs: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            mode: HealthCheckMode::default(),
            interval_secs: default_health_interval_secs(),
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directives; `RUST_LOG` takes precedence.
    #[serde(default)]
    pub filter: Option<String>,
    /// Directory for `toolhost.log`; stderr when unset.
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// Rotated files to keep.
    #[serde(default = "default_log_keep")]
    pub keep: u32,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: None,
            dir: None,
            keep: default_log_keep(),
            format: LogFormat::default(),
        }
    }
}

/// Top-level host configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HostConfig {
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    #[serde(default = "default_terminate_grace_ms")]
    pub terminate_grace_ms: u64,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    /// Discovery sources. `None` means the well-known host config files.
    #[serde(default)]
    pub sources: Option<Vec<ConfigSource>>,
    /// Allowlist of server ids. `None` means every discovered server.
    #[serde(default)]
    pub enabled_servers: Option<Vec<String>>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}
fn default_call_timeout_ms() -> u64 {
    30_000
}
fn default_terminate_grace_ms() -> u64 {
    2_000
}
fn default_shutdown_timeout_ms() -> u64 {
    5_000
}
fn default_health_interval_secs() -> u64 {
    60
}
fn default_log_keep() -> u32 {
    3
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: default_handshake_timeout_ms(),
            call_timeout_ms: default_call_timeout_ms(),
            terminate_grace_ms: default_terminate_grace_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            health_check: HealthCheckConfig::default(),
            sources: None,
            enabled_servers: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl HostConfig {
    /// Locate and load the config, or fall back to defaults if none exists.
    pub fn load_or_default(start: &Path) -> Result<Self, McpError> {
        match find_config_path(start) {
            Some(path) => load_host_config(&path),
            None => Ok(Self::default()),
        }
    }

    /// Timing keys as transport settings.
    pub fn transport_settings(&self) -> TransportSettings {
        TransportSettings {
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            call_timeout: Duration::from_millis(self.call_timeout_ms),
            terminate_grace: Duration::from_millis(self.terminate_grace_ms),
            shutdown_timeout: Duration::from_millis(self.shutdown_timeout_ms),
        }
    }

    /// Configured sources, or the well-known list.
    pub fn discovery_sources(&self) -> Vec<ConfigSource> {
        self.sources.clone().unwrap_or_else(well_known_sources)
    }

    /// A scanner over the configured sources with the allowlist applied.
    pub fn scanner(&self) -> DiscoveryScanner {
        let scanner = DiscoveryScanner::new(self.discovery_sources());
        match &self.enabled_servers {
            Some(enabled) => scanner.with_enabled_servers(enabled.clone()),
            None => scanner,
        }
    }

    fn expand_paths(&mut self) {
        if let Some(sources) = self.sources.as_mut() {
            for source in sources {
                source.path = expand_path(&source.path);
            }
        }
        if let Some(dir) = self.logging.dir.as_mut() {
            *dir = expand_path(dir);
        }
    }
}

fn expand_path(path: &Path) -> PathBuf {
    match path.to_str() {
        Some(s) => PathBuf::from(expand_tilde(s)),
        None => path.to_path_buf(),
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Find the config file: `TOOLHOST_CONFIG` if set, otherwise the nearest
/// `toolhost.yaml` walking upward from `start`.
pub fn find_config_path(start: &Path) -> Option<PathBuf> {
    locate_config(start, std::env::var_os(CONFIG_ENV_VAR))
}

fn locate_config(start: &Path, explicit: Option<OsString>) -> Option<PathBuf> {
    // An explicit path is returned even if missing so loading reports it
    if let Some(path) = explicit.filter(|p| !p.is_empty()) {
        return Some(PathBuf::from(expand_tilde(&path.to_string_lossy())));
    }

    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.is_file() {
            return Some(candidate);
        }
        if !dir.pop() {
            return None;
        }
    }
}

/// Load and parse a host config file.
pub fn load_host_config(path: &Path) -> Result<HostConfig, McpError> {
    let raw = std::fs::read_to_string(path).map_err(|e| McpError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;
    parse_host_config(&raw).map_err(|e| match e {
        McpError::ConfigError { reason } => McpError::ConfigError {
            reason: format!("{}: {reason}", path.display()),
        },
        other => other,
    })
}

/// Parse config text after env-var interpolation.
pub fn parse_host_config(raw: &str) -> Result<HostConfig, McpError> {
    let interpolated = interpolate_env_vars(raw);
    if interpolated.trim().is_empty() {
        return Ok(HostConfig::default());
    }

    let mut config: HostConfig =
        serde_yaml::from_str(&interpolated).map_err(|e| McpError::ConfigError {
            reason: format!("failed to parse config: {e}"),
        })?;
    config.expand_paths();
    Ok(config)
}

// ─── Interpolation ───────────────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` with environment values.
pub fn interpolate_env_vars(input: &str) -> String {
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

fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => std::env::var(name).unwrap_or_else(|_| expand_tilde(default)),
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &str) -> String {
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
    use tempfile::TempDir;

    use super::*;
    use crate::mcp_client::discovery::SourceKind;

    #[test]
    fn test_defaults_from_empty_document() {
        let config = parse_host_config("{}").unwrap();
        assert_eq!(config, HostConfig::default());
        assert_eq!(config.handshake_timeout_ms, 10_000);
        assert_eq!(config.health_check.mode, HealthCheckMode::OnDemand);
        assert_eq!(parse_host_config("  \n").unwrap(), HostConfig::default());
    }

    #[test]
    fn test_full_document() {
        let yaml = r#"
            handshake_timeout_ms: 2500
            call_timeout_ms: 1000
            health_check:
              mode: periodic
              interval_secs: 15
            sources:
              - label: team
                path: /etc/toolhost/servers.json
              - label: local
                path: ./mcp-servers
                kind: server_directory
            enabled_servers: [fs, search]
            logging:
              filter: "toolhost=debug"
              format: json
        "#;
        let config = parse_host_config(yaml).unwrap();
        assert_eq!(config.call_timeout_ms, 1000);
        assert_eq!(config.terminate_grace_ms, 2000);
        assert_eq!(config.health_check.mode, HealthCheckMode::Periodic);
        assert_eq!(config.health_check.interval(), Duration::from_secs(15));

        let sources = config.discovery_sources();
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].kind, SourceKind::Json);
        assert_eq!(sources[1].kind, SourceKind::ServerDirectory);
        assert_eq!(config.enabled_servers.as_deref().map(<[String]>::len), Some(2));
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.keep, 3);

        let settings = config.transport_settings();
        assert_eq!(settings.handshake_timeout, Duration::from_millis(2500));
        assert_eq!(settings.shutdown_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_yaml_is_config_error() {
        let err = parse_host_config("call_timeout_ms: [not a number").unwrap_err();
        assert!(matches!(err, McpError::ConfigError { .. }));
    }

    #[test]
    fn test_interpolate_env_vars_with_default() {
        std::env::remove_var("__TOOLHOST_TEST_UNSET__");
        let result = interpolate_env_vars("${__TOOLHOST_TEST_UNSET__:-/fallback/path}");
        assert_eq!(result, "/fallback/path");
    }

    #[test]
    fn test_interpolate_env_vars_with_value() {
        std::env::set_var("__TOOLHOST_TEST_SET__", "4000");
        let config = parse_host_config("call_timeout_ms: ${__TOOLHOST_TEST_SET__:-100}").unwrap();
        assert_eq!(config.call_timeout_ms, 4000);
        std::env::remove_var("__TOOLHOST_TEST_SET__");
    }

    #[test]
    fn test_interpolate_no_vars() {
        let input = "plain text with no variables, costs $5";
        assert_eq!(interpolate_env_vars(input), input);
    }

    #[test]
    fn test_expand_tilde() {
        let result = expand_tilde("~/Documents");
        assert!(!result.starts_with('~'), "tilde should be expanded");
        assert!(result.ends_with("/Documents"));
        assert_eq!(expand_tilde("/abs/path"), "/abs/path");
    }

    #[test]
    fn test_locate_config_walks_upward() {
        let tmp = TempDir::new().unwrap();
        let nested = tmp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(tmp.path().join(CONFIG_FILE_NAME), "call_timeout_ms: 5").unwrap();

        let found = locate_config(&nested, None).unwrap();
        assert_eq!(found, tmp.path().join(CONFIG_FILE_NAME));
        assert_eq!(load_host_config(&found).unwrap().call_timeout_ms, 5);
    }

    #[test]
    fn test_locate_config_prefers_explicit_path() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join(CONFIG_FILE_NAME), "{}").unwrap();

        let explicit = locate_config(tmp.path(), Some(OsString::from("/elsewhere/host.yaml")));
        assert_eq!(explicit, Some(PathBuf::from("/elsewhere/host.yaml")));

        let err = load_host_config(Path::new("/elsewhere/host.yaml")).unwrap_err();
        assert!(err.to_string().contains("failed to read"));
    }

    #[test]
    fn test_scanner_uses_allowlist_and_sources() {
        let config = parse_host_config(
            "sources:\n  - label: one\n    path: /nonexistent/one.json\nenabled_servers: [x]\n",
        )
        .unwrap();
        let scanner = config.scanner();
        assert_eq!(scanner.sources().len(), 1);
        assert!(scanner.scan().servers.is_empty());
    }
}
