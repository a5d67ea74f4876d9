//! MCP server discovery. Reads server declarations from other tools'
//! configuration files and from server directories, then merges them into
//! one deduplicated list.
//!
//! JSON sources are matched against a short, ordered list of known shapes;
//! the first shape yielding at least one server wins for that file. Two
//! declarations with the same normalized `(command, args)` are the same
//! server, whichever file they came from.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::ServerDefinition;
use crate::config::expand_tilde;

// ─── Sources ─────────────────────────────────────────────────────────────────

/// How a source is read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// A JSON file in one of the known shapes.
    #[default]
    Json,
    /// A directory whose subdirectories are servers, detected by convention.
    ServerDirectory,
}

/// One place to look for server declarations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSource {
    pub label: String,
    pub path: PathBuf,
    #[serde(default)]
    pub kind: SourceKind,
}

impl ConfigSource {
    pub fn json(label: &str, path: impl Into<PathBuf>) -> Self {
        Self {
            label: label.to_string(),
            path: path.into(),
            kind: SourceKind::Json,
        }
    }

    pub fn server_directory(label: &str, path: impl Into<PathBuf>) -> Self {
        Self {
            label: label.to_string(),
            path: path.into(),
            kind: SourceKind::ServerDirectory,
        }
    }
}

/// Config files of common MCP hosts, plus `.mcp.json` in the working
/// directory. Paths that cannot be resolved on this platform are omitted.
pub fn well_known_sources() -> Vec<ConfigSource> {
    let mut sources = Vec::new();

    if let Some(config) = dirs::config_dir() {
        sources.push(ConfigSource::json(
            "claude-desktop",
            config.join("Claude").join("claude_desktop_config.json"),
        ));
    }
    if let Some(home) = dirs::home_dir() {
        sources.push(ConfigSource::json("cursor", home.join(".cursor").join("mcp.json")));
        sources.push(ConfigSource::json(
            "windsurf",
            home.join(".codeium").join("windsurf").join("mcp_config.json"),
        ));
    }
    if let Some(config) = dirs::config_dir() {
        sources.push(ConfigSource::json(
            "vscode",
            config.join("Code").join("User").join("mcp.json"),
        ));
    }
    if let Ok(cwd) = std::env::current_dir() {
        sources.push(ConfigSource::json("project", cwd.join(".mcp.json")));
    }

    sources
}

// ─── Declarations ────────────────────────────────────────────────────────────

/// A server as declared in one source, before ids are assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredServer {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

impl DeclaredServer {
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey::new(&self.command, &self.args).in_dir(self.cwd.as_deref())
    }
}

/// Normalized launch signature used to merge declarations.
///
/// The working directory is part of the signature when one is declared:
/// the same relative entry point in two directories is two servers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DedupKey {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl DedupKey {
    pub fn new(command: &str, args: &[String]) -> Self {
        Self {
            command: normalize_command(command),
            args: args
                .iter()
                .map(|a| a.trim())
                .filter(|a| !a.is_empty())
                .map(str::to_string)
                .collect(),
            cwd: None,
        }
    }

    /// Qualify the key with a working directory, canonicalized when it exists.
    pub fn in_dir(mut self, cwd: Option<&Path>) -> Self {
        self.cwd = cwd.map(|dir| dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf()));
        self
    }
}

/// `/usr/bin/python3` → `python3`, `C:\node\npx.cmd` → `npx`.
fn normalize_command(command: &str) -> String {
    let trimmed = command.trim();
    let file_name = trimmed.rsplit(['/', '\\']).next().unwrap_or(trimmed);
    let lower = file_name.to_ascii_lowercase();
    for suffix in [".exe", ".cmd", ".bat"] {
        if lower.ends_with(suffix) {
            return file_name[..file_name.len() - suffix.len()].to_string();
        }
    }
    file_name.to_string()
}

// ─── JSON Shapes ─────────────────────────────────────────────────────────────

/// A shape parser: `Some` with at least one server if the document has this
/// shape, `None` otherwise.
pub type ShapeParser = fn(&Value) -> Option<Vec<DeclaredServer>>;

/// Known shapes, in the order they are tried.
pub const SHAPES: &[(&str, ShapeParser)] = &[
    ("mcpServers", parse_mcp_servers),
    ("servers", parse_servers),
    ("mcp.servers", parse_nested_mcp_servers),
    ("root", parse_root_map),
];

/// `{"mcpServers": {id: entry}}`: Claude Desktop, Cursor, Windsurf.
pub fn parse_mcp_servers(doc: &Value) -> Option<Vec<DeclaredServer>> {
    parse_server_map(doc.get("mcpServers")?)
}

/// `{"servers": {id: entry}}`: VS Code `mcp.json`.
pub fn parse_servers(doc: &Value) -> Option<Vec<DeclaredServer>> {
    parse_server_map(doc.get("servers")?)
}

/// `{"mcp": {"servers": {id: entry}}}`: VS Code `settings.json`.
pub fn parse_nested_mcp_servers(doc: &Value) -> Option<Vec<DeclaredServer>> {
    parse_server_map(doc.get("mcp")?.get("servers")?)
}

/// `{id: entry}` at the top level.
pub fn parse_root_map(doc: &Value) -> Option<Vec<DeclaredServer>> {
    parse_server_map(doc)
}

fn parse_server_map(map: &Value) -> Option<Vec<DeclaredServer>> {
    let servers: Vec<DeclaredServer> = map
        .as_object()?
        .iter()
        .filter_map(|(name, entry)| parse_entry(name, entry))
        .collect();
    (!servers.is_empty()).then_some(servers)
}

/// One `id → {command, args, cwd, env}` entry. Disabled entries and
/// non-stdio transports are skipped.
fn parse_entry(name: &str, entry: &Value) -> Option<DeclaredServer> {
    let obj = entry.as_object()?;

    if obj.get("disabled").and_then(Value::as_bool) == Some(true) {
        return None;
    }
    if let Some(kind) = obj.get("type").and_then(Value::as_str) {
        if kind != "stdio" {
            return None;
        }
    }

    let command = obj.get("command")?.as_str()?.trim();
    if command.is_empty() {
        return None;
    }

    let args = obj
        .get("args")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|a| a.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    let cwd = obj
        .get("cwd")
        .and_then(Value::as_str)
        .filter(|c| !c.trim().is_empty())
        .map(|c| PathBuf::from(expand_tilde(c)));

    let env = obj
        .get("env")
        .and_then(Value::as_object)
        .map(|vars| {
            vars.iter()
                .filter_map(|(key, value)| {
                    let value = match value {
                        Value::String(s) => s.clone(),
                        Value::Number(n) => n.to_string(),
                        Value::Bool(b) => b.to_string(),
                        _ => return None,
                    };
                    Some((key.clone(), value))
                })
                .collect()
        })
        .unwrap_or_default();

    Some(DeclaredServer {
        name: name.to_string(),
        command: command.to_string(),
        args,
        cwd,
        env,
    })
}

/// Parse a config document and try each shape in order.
///
/// `Ok(None)` means valid JSON in none of the known shapes.
pub fn parse_config_bytes(bytes: &[u8]) -> Result<Option<Vec<DeclaredServer>>, serde_json::Error> {
    let doc: Value = serde_json::from_slice(bytes)?;
    Ok(SHAPES.iter().find_map(|(_, parse)| parse(&doc)))
}

// ─── Server Directories ──────────────────────────────────────────────────────

/// Windows requires `npx.cmd` because `npx` is a batch script.
fn default_npx_command() -> &'static str {
    if cfg!(target_os = "windows") {
        "npx.cmd"
    } else {
        "npx"
    }
}

/// macOS 12.3+ removed the `python` symlink; only `python3` exists.
fn default_python_command() -> &'static str {
    if cfg!(target_os = "windows") {
        "python"
    } else {
        "python3"
    }
}

/// Interpreter inside a server-local `.venv`, if there is one.
fn venv_python(server_dir: &Path) -> Option<PathBuf> {
    let venv = server_dir.join(".venv");
    if !venv.is_dir() {
        return None;
    }
    let python = if cfg!(target_os = "windows") {
        venv.join("Scripts").join("python.exe")
    } else {
        venv.join("bin").join("python3")
    };
    Some(python)
}

/// `src/server.py` is preferred; `src/main.py` is the alternative.
fn detect_py_entry_module(server_dir: &Path) -> &'static str {
    if server_dir.join("src").join("main.py").exists()
        && !server_dir.join("src").join("server.py").exists()
    {
        "src.main"
    } else {
        "src.server"
    }
}

/// Subdirectories of `root` that look like servers: `package.json` for
/// TypeScript, `pyproject.toml` for Python. Names starting with `_` or `.`
/// are skipped.
pub fn scan_server_directory(root: &Path) -> Vec<DeclaredServer> {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!(path = %root.display(), error = %e, "server directory not readable, skipping");
            return Vec::new();
        }
    };

    let mut dirs: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();

    let mut servers = Vec::new();
    for dir in dirs {
        let Some(name) = dir.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            continue;
        };
        if name.starts_with('_') || name.starts_with('.') {
            continue;
        }

        let cwd = dir.canonicalize().unwrap_or_else(|_| dir.clone());
        let declared = if dir.join("package.json").exists() {
            DeclaredServer {
                name,
                command: default_npx_command().to_string(),
                args: vec!["tsx".to_string(), "src/index.ts".to_string()],
                cwd: Some(cwd),
                env: HashMap::new(),
            }
        } else if dir.join("pyproject.toml").exists() {
            let command = venv_python(&dir)
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_else(|| default_python_command().to_string());
            DeclaredServer {
                name,
                command,
                args: vec!["-m".to_string(), detect_py_entry_module(&dir).to_string()],
                cwd: Some(cwd),
                env: HashMap::new(),
            }
        } else {
            continue;
        };

        tracing::debug!(server = %declared.name, command = %declared.command, "found server directory");
        servers.push(declared);
    }
    servers
}

// ─── Scanner ─────────────────────────────────────────────────────────────────

/// A source that could not be used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedSource {
    pub label: String,
    pub reason: String,
}

/// Result of one scan.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DiscoveryReport {
    /// Servers found in each source, with canonical ids assigned.
    pub per_source: BTreeMap<String, Vec<ServerDefinition>>,
    /// Deduplicated servers, in first-seen order, after the allowlist.
    pub servers: Vec<ServerDefinition>,
    /// Sources that existed but could not be parsed.
    pub skipped: Vec<SkippedSource>,
}

/// Reads every configured source and merges the results.
#[derive(Debug, Clone)]
pub struct DiscoveryScanner {
    sources: Vec<ConfigSource>,
    enabled_servers: Option<BTreeSet<String>>,
}

impl DiscoveryScanner {
    pub fn new(sources: Vec<ConfigSource>) -> Self {
        Self {
            sources,
            enabled_servers: None,
        }
    }

    pub fn with_well_known_sources() -> Self {
        Self::new(well_known_sources())
    }

    /// Keep only servers whose canonical id or declared name is listed.
    pub fn with_enabled_servers(mut self, enabled: Vec<String>) -> Self {
        self.enabled_servers = Some(enabled.into_iter().collect());
        self
    }

    pub fn sources(&self) -> &[ConfigSource] {
        &self.sources
    }

    /// Read one source. Missing or unreadable files yield `Ok(empty)`;
    /// malformed JSON is an `Err` with the parse error.
    pub fn read_source(source: &ConfigSource) -> Result<Vec<DeclaredServer>, String> {
        match source.kind {
            SourceKind::ServerDirectory => Ok(scan_server_directory(&source.path)),
            SourceKind::Json => {
                let bytes = match std::fs::read(&source.path) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::debug!(
                            source = %source.label,
                            path = %source.path.display(),
                            error = %e,
                            "config source not readable, skipping"
                        );
                        return Ok(Vec::new());
                    }
                };
                match parse_config_bytes(&bytes) {
                    Ok(Some(servers)) => Ok(servers),
                    Ok(None) => {
                        tracing::debug!(source = %source.label, "no known server shape in config source");
                        Ok(Vec::new())
                    }
                    Err(e) => Err(format!("malformed JSON in {}: {e}", source.path.display())),
                }
            }
        }
    }

    /// Scan all sources in order and deduplicate.
    pub fn scan(&self) -> DiscoveryReport {
        self.scan_reserving(&BTreeSet::new())
    }

    /// Like `scan`, but never hands out an id in `reserved`; a colliding
    /// server gets a numeric suffix instead.
    pub fn scan_reserving(&self, reserved: &BTreeSet<String>) -> DiscoveryReport {
        let mut merger = Merger::reserving(reserved);
        let mut skipped = Vec::new();
        let mut placements: Vec<(String, Vec<usize>)> = Vec::new();

        for source in &self.sources {
            match Self::read_source(source) {
                Ok(declared) => {
                    let indices = declared
                        .into_iter()
                        .map(|d| merger.add(&source.label, d))
                        .collect();
                    placements.push((source.label.clone(), indices));
                }
                Err(reason) => {
                    tracing::warn!(source = %source.label, reason = %reason, "skipping config source");
                    skipped.push(SkippedSource {
                        label: source.label.clone(),
                        reason,
                    });
                }
            }
        }

        let mut per_source: BTreeMap<String, Vec<ServerDefinition>> = BTreeMap::new();
        for (label, indices) in placements {
            let entry = per_source.entry(label).or_default();
            for index in indices {
                let def = &merger.definitions[index];
                if !entry.iter().any(|d| d.id == def.id) {
                    entry.push(def.clone());
                }
            }
        }

        let servers: Vec<ServerDefinition> = match &self.enabled_servers {
            Some(enabled) => merger
                .definitions
                .into_iter()
                .filter(|d| enabled.contains(&d.id) || enabled.contains(&d.display_name))
                .collect(),
            None => merger.definitions,
        };

        tracing::info!(
            sources = self.sources.len(),
            skipped = skipped.len(),
            servers = servers.len(),
            "discovery scan complete"
        );

        DiscoveryReport {
            per_source,
            servers,
            skipped,
        }
    }
}

/// Accumulates declarations into canonical definitions.
#[derive(Default)]
struct Merger {
    definitions: Vec<ServerDefinition>,
    by_key: HashMap<DedupKey, usize>,
    ids: HashSet<String>,
}

impl Merger {
    fn reserving(reserved: &BTreeSet<String>) -> Self {
        Self {
            ids: reserved.iter().cloned().collect(),
            ..Self::default()
        }
    }

    /// Merge one declaration; returns the index of its definition.
    fn add(&mut self, label: &str, declared: DeclaredServer) -> usize {
        let key = declared.dedup_key();
        if let Some(&index) = self.by_key.get(&key) {
            let def = &mut self.definitions[index];
            if !def.sources.iter().any(|s| s == label) {
                def.sources.push(label.to_string());
            }
            tracing::debug!(server = %def.id, source = label, "merged duplicate server declaration");
            return index;
        }

        let id = self.unique_id(&slugify(&declared.name));
        let index = self.definitions.len();
        self.definitions.push(ServerDefinition {
            id,
            display_name: declared.name,
            command: declared.command,
            args: declared.args,
            cwd: declared.cwd,
            env: declared.env,
            sources: vec![label.to_string()],
        });
        self.by_key.insert(key, index);
        index
    }

    fn unique_id(&mut self, base: &str) -> String {
        let mut candidate = base.to_string();
        let mut n = 2;
        while self.ids.contains(&candidate) {
            candidate = format!("{base}-{n}");
            n += 1;
        }
        self.ids.insert(candidate.clone());
        candidate
    }
}

/// Lowercase, non-alphanumerics collapsed to single `-`.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        "server".to_string()
    } else {
        slug.to_string()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
