//! Tool invoker: the public entry point for running tools.
//!
//! Resolves a server id through the registry, obtains a ready transport from
//! the pool, and issues the call. Every outcome comes back as an
//! [`ExecutionResult`]; callers never see transport-level errors directly.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{watch, RwLock};

use super::discovery::{DiscoveryReport, DiscoveryScanner};
use super::errors::McpError;
use super::pool::TransportPool;
use super::registry::{Availability, ServerRegistry};
use super::transport::{Transport, TransportSettings};
use super::types::{
    ExecutionResult, ServerDefinition, ToolDescriptor, TransportState, TransportStatus,
};
use crate::config::{HealthCheckConfig, HostConfig};

// ─── Views ───────────────────────────────────────────────────────────────────

/// One row of `list_servers`.
#[derive(Debug, Clone, Serialize)]
pub struct ServerSummary {
    pub id: String,
    pub display_name: String,
    pub command: String,
    pub args: Vec<String>,
    pub sources: Vec<String>,
    pub availability: Availability,
    /// `None` until the server has completed a handshake.
    pub tool_count: Option<usize>,
    pub connected: bool,
}

/// Result of `connection_status`.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub server_id: String,
    pub availability: Availability,
    /// The pooled transport, if one exists.
    pub transport: Option<TransportStatus>,
    pub last_failure: Option<String>,
}

// ─── ToolInvoker ─────────────────────────────────────────────────────────────

/// Owns the registry, the transport pool, and discovery for one host.
pub struct ToolInvoker {
    registry: RwLock<ServerRegistry>,
    pool: TransportPool,
    scanner: DiscoveryScanner,
    health: HealthCheckConfig,
    stop: watch::Sender<bool>,
}

impl ToolInvoker {
    pub fn new(scanner: DiscoveryScanner, settings: TransportSettings) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            registry: RwLock::new(ServerRegistry::new()),
            pool: TransportPool::new(settings),
            scanner,
            health: HealthCheckConfig::default(),
            stop,
        }
    }

    /// Build an invoker from host configuration. No servers are known until
    /// `refresh` or `register` is called.
    pub fn from_config(config: &HostConfig) -> Self {
        let mut invoker = Self::new(config.scanner(), config.transport_settings());
        invoker.health = config.health_check.clone();
        invoker
    }

    pub fn health_config(&self) -> &HealthCheckConfig {
        &self.health
    }

    pub fn settings(&self) -> &TransportSettings {
        self.pool.settings()
    }

    /// Receiver that flips to `true` when `shutdown` starts.
    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }

    pub fn is_shut_down(&self) -> bool {
        self.pool.is_shutting_down()
    }

    // ─── Registry ────────────────────────────────────────────────────────

    /// Rescan discovery sources and update the registry. Pooled transports
    /// for servers that changed or disappeared are closed.
    pub async fn refresh(&self) -> DiscoveryReport {
        let scanner = self.scanner.clone();
        let reserved = self.registry.read().await.registered_ids();
        let scan = tokio::task::spawn_blocking(move || scanner.scan_reserving(&reserved));
        let report = match scan.await {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(error = %e, "discovery scan panicked");
                return DiscoveryReport::default();
            }
        };

        let diff = self
            .registry
            .write()
            .await
            .apply_discovery(report.servers.clone());
        for id in diff.changed.iter().chain(&diff.removed) {
            self.pool.discard(id).await;
        }
        report
    }

    /// Add or replace a server outside of discovery.
    pub async fn register(&self, definition: ServerDefinition) {
        let id = definition.id.clone();
        let relaunch = self.registry.write().await.register(definition);
        if relaunch {
            self.pool.discard(&id).await;
        }
    }

    /// Remove a server and close its transport. Returns whether it existed.
    pub async fn unregister(&self, server_id: &str) -> bool {
        let removed = self.registry.write().await.unregister(server_id).is_some();
        self.pool.discard(server_id).await;
        removed
    }

    pub async fn list_servers(&self) -> Vec<ServerSummary> {
        let connected: Vec<String> = self
            .pool
            .statuses()
            .await
            .into_iter()
            .filter(|s| s.state == TransportState::Ready)
            .map(|s| s.server_id)
            .collect();

        self.registry
            .read()
            .await
            .servers()
            .map(|entry| ServerSummary {
                id: entry.definition.id.clone(),
                display_name: entry.definition.display_name.clone(),
                command: entry.definition.command.clone(),
                args: entry.definition.args.clone(),
                sources: entry.definition.sources.clone(),
                availability: entry.availability.clone(),
                tool_count: entry.tools.as_ref().map(Vec::len),
                connected: connected.contains(&entry.definition.id),
            })
            .collect()
    }

    /// Tools declared by `server_id`, connecting first if they are not
    /// known yet.
    pub async fn list_tools(&self, server_id: &str) -> Result<Vec<ToolDescriptor>, McpError> {
        let definition = {
            let registry = self.registry.read().await;
            let definition = registry.definition(server_id)?;
            if let Some(tools) = registry.get(server_id).and_then(|e| e.tools.clone()) {
                return Ok(tools);
            }
            definition.clone()
        };

        let transport = self.ready_transport(&definition).await?;
        Ok(transport.tools())
    }

    pub async fn connection_status(&self, server_id: &str) -> Result<ConnectionStatus, McpError> {
        let availability = {
            let registry = self.registry.read().await;
            registry
                .get(server_id)
                .map(|entry| entry.availability.clone())
                .ok_or_else(|| McpError::UnknownServer {
                    server: server_id.to_string(),
                })?
        };

        Ok(ConnectionStatus {
            server_id: server_id.to_string(),
            availability,
            transport: self.pool.status(server_id).await,
            last_failure: self
                .pool
                .last_failure(server_id)
                .map(|f| f.error.to_string()),
        })
    }

    // ─── Invocation ──────────────────────────────────────────────────────

    /// Run `tool` on `server_id`. `timeout` defaults to the configured call
    /// timeout.
    pub async fn invoke(
        &self,
        server_id: &str,
        tool: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> ExecutionResult {
        let started = Instant::now();
        let outcome = self.call(server_id, tool, params, timeout).await;
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match outcome {
            Ok(payload) => {
                tracing::debug!(server = server_id, tool, elapsed_ms, "tool call succeeded");
                ExecutionResult::ok(payload, elapsed_ms)
            }
            Err(e) => {
                tracing::warn!(
                    server = server_id,
                    tool,
                    kind = %e.kind(),
                    error = %e,
                    elapsed_ms,
                    "tool call failed"
                );
                ExecutionResult::from_error(&e, elapsed_ms)
            }
        }
    }

    async fn call(
        &self,
        server_id: &str,
        tool: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, McpError> {
        let definition = {
            let registry = self.registry.read().await;
            registry.validate_tool_call(server_id, tool, &params)?;
            registry.definition(server_id)?.clone()
        };

        let transport = self.ready_transport(&definition).await?;
        let timeout = timeout.unwrap_or(self.pool.settings().call_timeout);
        transport.call_tool(tool, params, timeout).await
    }

    /// Get a ready transport and record what it tells us about the server.
    async fn ready_transport(
        &self,
        definition: &ServerDefinition,
    ) -> Result<Arc<Transport>, McpError> {
        let server_id = definition.id.as_str();
        match self.pool.get_transport(definition).await {
            Ok(transport) => {
                let stale = self.registry.read().await.get(server_id).is_some_and(|entry| {
                    entry.tools.is_none() || entry.availability != Availability::Online
                });
                if stale {
                    let mut registry = self.registry.write().await;
                    registry.record_tools(server_id, transport.tools());
                    registry.mark_online(server_id);
                }
                Ok(transport)
            }
            Err(e) => {
                self.registry
                    .write()
                    .await
                    .mark_offline(server_id, &e.to_string());
                Err(e)
            }
        }
    }

    /// Try to reconnect every offline server. Returns the ids that came back.
    pub async fn revalidate_offline(&self) -> Vec<String> {
        let offline: Vec<ServerDefinition> = {
            let registry = self.registry.read().await;
            registry
                .offline_ids()
                .iter()
                .filter_map(|id| registry.definition(id).ok().cloned())
                .collect()
        };
        if offline.is_empty() {
            return Vec::new();
        }

        let attempts = offline.iter().map(|def| async move {
            self.ready_transport(def).await.ok().map(|_| def.id.clone())
        });
        let recovered: Vec<String> = futures::future::join_all(attempts)
            .await
            .into_iter()
            .flatten()
            .collect();

        tracing::info!(
            checked = offline.len(),
            recovered = recovered.len(),
            "revalidated offline servers"
        );
        recovered
    }

    /// Stop background work and close every transport.
    pub async fn shutdown(&self) {
        self.stop.send_replace(true);
        self.pool.close_all().await;
    }
}

impl std::fmt::Debug for ToolInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolInvoker")
            .field("pool", &self.pool)
            .field("scanner", &self.scanner)
            .finish_non_exhaustive()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
