//! Shared types for the MCP client.
//!
//! JSON-RPC 2.0 message types, MCP protocol structures, and the data model
//! shared by the transport, registry, and discovery layers.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::{ErrorKind, McpError};

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 notification (no id, no response).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

// ─── MCP Protocol Types ──────────────────────────────────────────────────────

/// Protocol revision sent in `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// A tool declared by a server, learned during the handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "inputSchema", alias = "params_schema")]
    pub parameter_schema: serde_json::Value,
}

/// MCP initialize response payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InitializeResult {
    #[serde(default, alias = "protocolVersion")]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: serde_json::Value,
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
    #[serde(default, alias = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

impl InitializeResult {
    /// Whether the server advertised a `tools` capability.
    pub fn advertises_tools(&self) -> bool {
        self.capabilities.get("tools").is_some()
    }
}

/// Payload of a `tools/list` response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolsListResult {
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
}

/// Server info returned in the initialize response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

// ─── Server Definitions ──────────────────────────────────────────────────────

/// Normalized description of how to launch one logical server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDefinition {
    /// Canonical, registry-unique id.
    pub id: String,
    /// Name as it appeared in the first configuration source.
    pub display_name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Labels of every configuration source that declared this server.
    #[serde(default)]
    pub sources: Vec<String>,
}

impl ServerDefinition {
    /// Create a definition with no cwd, env, or source labels.
    pub fn new(id: &str, command: &str, args: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            display_name: id.to_string(),
            command: command.to_string(),
            args: args.iter().map(|a| (*a).to_string()).collect(),
            cwd: None,
            env: HashMap::new(),
            sources: Vec::new(),
        }
    }

    /// Source labels joined for display (e.g. `"cursor, claude-desktop"`).
    pub fn source_label(&self) -> String {
        self.sources.join(", ")
    }

    /// Whether two definitions would launch the same process.
    pub fn same_launch(&self, other: &Self) -> bool {
        self.command == other.command
            && self.args == other.args
            && self.cwd == other.cwd
            && self.env == other.env
    }
}

// ─── Transport State ─────────────────────────────────────────────────────────

/// Lifecycle state of one transport instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportState {
    Disconnected,
    Connecting,
    Ready,
    Closing,
    Failed,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Closing => "closing",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Point-in-time snapshot of a pooled transport.
#[derive(Debug, Clone, Serialize)]
pub struct TransportStatus {
    pub server_id: String,
    /// Distinguishes successive connections to the same server.
    pub instance_id: Uuid,
    pub state: TransportState,
    pub pid: Option<u32>,
    pub connected_at: Option<DateTime<Utc>>,
    pub pending_calls: usize,
    pub tool_count: usize,
    pub malformed_frames: u64,
}

// ─── Results ─────────────────────────────────────────────────────────────────

/// Outcome of one tool invocation, normalized across every failure mode.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub payload: Option<serde_json::Value>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub elapsed_ms: u64,
}

impl ExecutionResult {
    pub fn ok(payload: serde_json::Value, elapsed_ms: u64) -> Self {
        Self {
            success: true,
            payload: Some(payload),
            error_kind: None,
            error_message: None,
            elapsed_ms,
        }
    }

    /// Build a failed result from an error. Tool-level error payloads are
    /// kept so callers can show the server's own message.
    pub fn from_error(err: &McpError, elapsed_ms: u64) -> Self {
        let payload = match err {
            McpError::ToolFailed { payload, .. } => Some(payload.clone()),
            McpError::ServerError { data, .. } => data.clone(),
            _ => None,
        };
        Self {
            success: false,
            payload,
            error_kind: Some(err.kind()),
            error_message: Some(err.to_string()),
            elapsed_ms,
        }
    }
}

// ─── Standard MCP Error Codes ────────────────────────────────────────────────

/// Well-known JSON-RPC / MCP error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i64 = -32700;
    /// The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i64 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i64 = -32603;
}

// ─── Tests ───────────────────────────────────────────────────────────────────
