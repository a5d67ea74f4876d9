//! Server registry. Tracks the known servers, their declared tools, and whether
//! they were last seen reachable.
//!
//! Populated by discovery (or explicit registration) and consulted by the
//! façade before any process is spawned: unknown servers and tools are
//! rejected here, with close-name suggestions for typos.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::errors::McpError;
use super::types::{ServerDefinition, ToolDescriptor};

/// Suggestions offered for an unknown tool name.
const MAX_SUGGESTIONS: usize = 3;

/// Similarity floor below which a name is not worth suggesting.
const SUGGESTION_FLOOR: f64 = 0.3;

// ─── Entries ─────────────────────────────────────────────────────────────────

/// Reachability as last observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Availability {
    /// Never connected.
    Unknown,
    Online,
    Offline { reason: String },
}

/// How an entry got into the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerOrigin {
    /// From a discovery scan; removed when a later scan no longer sees it.
    Discovered,
    /// Added through `register`; survives discovery refreshes.
    Registered,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisteredServer {
    pub definition: ServerDefinition,
    /// `None` until a handshake has reported the tool list.
    pub tools: Option<Vec<ToolDescriptor>>,
    pub availability: Availability,
    pub origin: ServerOrigin,
    pub last_seen: Option<DateTime<Utc>>,
}

impl RegisteredServer {
    fn new(definition: ServerDefinition, origin: ServerOrigin) -> Self {
        Self {
            definition,
            tools: None,
            availability: Availability::Unknown,
            origin,
            last_seen: None,
        }
    }

    pub fn is_offline(&self) -> bool {
        matches!(self.availability, Availability::Offline { .. })
    }

    /// Replace the definition. A different launch signature invalidates
    /// the learned tools and availability. Returns whether it did.
    fn update(&mut self, definition: ServerDefinition) -> bool {
        let relaunch = !self.definition.same_launch(&definition);
        self.definition = definition;
        if relaunch {
            self.tools = None;
            self.availability = Availability::Unknown;
        }
        relaunch
    }
}

/// Outcome of applying a discovery scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryDiff {
    pub added: Vec<String>,
    /// Same id, different launch signature.
    pub changed: Vec<String>,
    pub removed: Vec<String>,
}

impl RegistryDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }
}

// ─── ServerRegistry ──────────────────────────────────────────────────────────

/// Known servers keyed by canonical id.
#[derive(Debug, Clone, Default)]
pub struct ServerRegistry {
    servers: BTreeMap<String, RegisteredServer>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert every discovered server and drop discovered entries that are
    /// no longer present. Explicitly registered servers are left alone: a
    /// discovered server whose id is taken by one is skipped.
    pub fn apply_discovery(&mut self, definitions: Vec<ServerDefinition>) -> RegistryDiff {
        let mut diff = RegistryDiff::default();
        let seen: BTreeSet<String> = definitions.iter().map(|d| d.id.clone()).collect();

        for definition in definitions {
            let id = definition.id.clone();
            match self.servers.get_mut(&id) {
                Some(existing) if existing.origin == ServerOrigin::Registered => {
                    tracing::warn!(
                        server = %id,
                        command = %definition.command,
                        "discovered server id is taken by a registered server, skipping"
                    );
                }
                Some(existing) => {
                    if existing.update(definition) {
                        diff.changed.push(id);
                    }
                }
                None => {
                    self.servers
                        .insert(id.clone(), RegisteredServer::new(definition, ServerOrigin::Discovered));
                    diff.added.push(id);
                }
            }
        }

        self.servers.retain(|id, entry| {
            let keep = entry.origin == ServerOrigin::Registered || seen.contains(id);
            if !keep {
                diff.removed.push(id.clone());
            }
            keep
        });

        if !diff.is_empty() {
            tracing::info!(
                added = diff.added.len(),
                changed = diff.changed.len(),
                removed = diff.removed.len(),
                "registry updated from discovery"
            );
        }
        diff
    }

    /// Add or replace one server. Returns `true` if an existing entry's
    /// launch signature changed.
    pub fn register(&mut self, definition: ServerDefinition) -> bool {
        match self.servers.get_mut(&definition.id) {
            Some(existing) => {
                existing.origin = ServerOrigin::Registered;
                existing.update(definition)
            }
            None => {
                self.servers.insert(
                    definition.id.clone(),
                    RegisteredServer::new(definition, ServerOrigin::Registered),
                );
                false
            }
        }
    }

    /// Ids of servers added with `register`.
    pub fn registered_ids(&self) -> BTreeSet<String> {
        self.servers
            .iter()
            .filter(|(_, entry)| entry.origin == ServerOrigin::Registered)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Remove a server entirely.
    pub fn unregister(&mut self, server_id: &str) -> Option<RegisteredServer> {
        self.servers.remove(server_id)
    }

    pub fn get(&self, server_id: &str) -> Option<&RegisteredServer> {
        self.servers.get(server_id)
    }

    /// The definition for `server_id`, or `UnknownServer`.
    pub fn definition(&self, server_id: &str) -> Result<&ServerDefinition, McpError> {
        self.servers
            .get(server_id)
            .map(|entry| &entry.definition)
            .ok_or_else(|| McpError::UnknownServer {
                server: server_id.to_string(),
            })
    }

    /// Entries in id order.
    pub fn servers(&self) -> impl Iterator<Item = &RegisteredServer> {
        self.servers.values()
    }

    pub fn server_ids(&self) -> Vec<String> {
        self.servers.keys().cloned().collect()
    }

    pub fn offline_ids(&self) -> Vec<String> {
        self.servers
            .iter()
            .filter(|(_, entry)| entry.is_offline())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    // ─── Observations ────────────────────────────────────────────────────

    pub fn record_tools(&mut self, server_id: &str, tools: Vec<ToolDescriptor>) {
        if let Some(entry) = self.servers.get_mut(server_id) {
            entry.tools = Some(tools);
        }
    }

    pub fn mark_online(&mut self, server_id: &str) {
        if let Some(entry) = self.servers.get_mut(server_id) {
            if entry.availability != Availability::Online {
                tracing::info!(server = server_id, "server online");
            }
            entry.availability = Availability::Online;
            entry.last_seen = Some(Utc::now());
        }
    }

    pub fn mark_offline(&mut self, server_id: &str, reason: &str) {
        if let Some(entry) = self.servers.get_mut(server_id) {
            if !entry.is_offline() {
                tracing::warn!(server = server_id, reason, "server offline");
            }
            entry.availability = Availability::Offline {
                reason: reason.to_string(),
            };
        }
    }

    // ─── Validation ──────────────────────────────────────────────────────

    /// Check that `tool` exists on `server_id` and that `arguments` carry
    /// every field the tool's schema lists as `required`.
    ///
    /// Servers whose tool list is not known yet pass through; the server
    /// itself is the final judge.
    pub fn validate_tool_call(
        &self,
        server_id: &str,
        tool: &str,
        arguments: &serde_json::Value,
    ) -> Result<(), McpError> {
        let entry = self.servers.get(server_id).ok_or_else(|| McpError::UnknownServer {
            server: server_id.to_string(),
        })?;
        let Some(tools) = entry.tools.as_deref() else {
            return Ok(());
        };

        let Some(def) = tools.iter().find(|t| t.name == tool) else {
            return Err(McpError::UnknownTool {
                server: server_id.to_string(),
                tool: tool.to_string(),
                suggestions: find_similar(tools, tool, MAX_SUGGESTIONS),
            });
        };

        let Some(required) = def.parameter_schema.get("required").and_then(|r| r.as_array())
        else {
            return Ok(());
        };

        let args = arguments.as_object();
        for field in required.iter().filter_map(|f| f.as_str()) {
            let present = args.is_some_and(|obj| obj.contains_key(field));
            if !present {
                return Err(McpError::InvalidArguments {
                    tool: tool.to_string(),
                    reason: format!("missing required field: '{field}'"),
                });
            }
        }
        Ok(())
    }
}

/// Up to `max_results` tool names closest to `name`, best first.
pub fn find_similar(tools: &[ToolDescriptor], name: &str, max_results: usize) -> Vec<String> {
    let mut scored: Vec<(&str, f64)> = tools
        .iter()
        .map(|t| (t.name.as_str(), similarity(name, &t.name)))
        .filter(|(_, score)| *score > SUGGESTION_FLOOR)
        .collect();

    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(max_results);
    scored.into_iter().map(|(n, _)| n.to_string()).collect()
}

// ─── Edit Distance ──────────────────────────────────────────────────────────

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

/// 0.0 = nothing in common, 1.0 = identical.
fn similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - (levenshtein(a, b) as f64 / max_len as f64)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
