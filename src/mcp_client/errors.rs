//! MCP Client error types.
//!
//! Every variant maps onto one [`ErrorKind`], which is what callers of the
//! [`ToolInvoker`](super::client::ToolInvoker) façade see in an
//! `ExecutionResult`.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ─── ErrorKind ───────────────────────────────────────────────────────────────

/// Normalized failure category reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The server process could not be started.
    LaunchError,
    /// The `initialize` exchange did not complete in time.
    HandshakeTimeout,
    /// The process exited or its pipes failed mid-session.
    ConnectionLost,
    /// No matching response arrived before the call deadline.
    CallTimeout,
    /// The server sent something that is not a valid protocol message.
    ProtocolError,
    /// The server answered with a well-formed error.
    ToolError,
    /// Unknown server or tool.
    NotFound,
    /// No ready connection could be produced for the server.
    Unavailable,
    /// The call was abandoned because its connection was closed.
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::LaunchError => "LaunchError",
            Self::HandshakeTimeout => "HandshakeTimeout",
            Self::ConnectionLost => "ConnectionLost",
            Self::CallTimeout => "CallTimeout",
            Self::ProtocolError => "ProtocolError",
            Self::ToolError => "ToolError",
            Self::NotFound => "NotFound",
            Self::Unavailable => "Unavailable",
            Self::Cancelled => "Cancelled",
        };
        f.write_str(label)
    }
}

// ─── McpError ────────────────────────────────────────────────────────────────

/// Errors that can occur during MCP client operations.
#[derive(Debug, Clone, Error)]
pub enum McpError {
    /// A server process failed to start.
    #[error("failed to launch server '{server}': {reason}")]
    LaunchFailed { server: String, reason: String },

    /// The initialization handshake did not finish within its budget.
    #[error("server '{server}' did not complete initialization within {timeout_ms}ms{stderr}")]
    HandshakeTimeout {
        server: String,
        timeout_ms: u64,
        stderr: String,
    },

    /// The server answered `initialize` with an error or an unusable payload.
    #[error("server '{server}' initialization failed: {reason}")]
    HandshakeFailed { server: String, reason: String },

    /// Process exited or an I/O error occurred on its pipes.
    #[error("connection to server '{server}' lost: {reason}")]
    ConnectionLost { server: String, reason: String },

    /// A call timed out.
    #[error("call '{tool}' on server '{server}' timed out after {timeout_ms}ms")]
    CallTimeout {
        server: String,
        tool: String,
        timeout_ms: u64,
    },

    /// Malformed protocol message.
    #[error("protocol error from server '{server}': {reason}")]
    Protocol { server: String, reason: String },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// The tool ran but flagged its own result as an error (`isError`).
    #[error("tool '{tool}' reported an error: {message}")]
    ToolFailed {
        tool: String,
        message: String,
        payload: serde_json::Value,
    },

    /// Tool call arguments failed schema validation.
    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    /// Server id not present in the registry.
    #[error("unknown server: '{server}'")]
    UnknownServer { server: String },

    /// Tool not declared by the server.
    #[error("unknown tool '{tool}' on server '{server}'{}", format_suggestions(.suggestions))]
    UnknownTool {
        server: String,
        tool: String,
        suggestions: Vec<String>,
    },

    /// The transport exists but cannot accept calls in its current state.
    #[error("server '{server}' is not ready (state: {state})")]
    NotReady { server: String, state: String },

    /// The pool could not produce a ready transport.
    #[error("server '{server}' is unavailable: {source}")]
    Unavailable {
        server: String,
        #[source]
        source: Box<McpError>,
    },

    /// The call was cancelled because its transport was closed.
    #[error("call '{tool}' on server '{server}' was cancelled")]
    Cancelled { server: String, tool: String },

    /// Configuration error (unreadable or invalid config file).
    #[error("config error: {reason}")]
    ConfigError { reason: String },
}

impl McpError {
    /// The normalized category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::LaunchFailed { .. } => ErrorKind::LaunchError,
            Self::HandshakeTimeout { .. } => ErrorKind::HandshakeTimeout,
            Self::HandshakeFailed { .. } | Self::Protocol { .. } | Self::ConfigError { .. } => {
                ErrorKind::ProtocolError
            }
            Self::ConnectionLost { .. } => ErrorKind::ConnectionLost,
            Self::CallTimeout { .. } => ErrorKind::CallTimeout,
            Self::ServerError { .. } | Self::ToolFailed { .. } | Self::InvalidArguments { .. } => {
                ErrorKind::ToolError
            }
            Self::UnknownServer { .. } | Self::UnknownTool { .. } => ErrorKind::NotFound,
            Self::NotReady { .. } | Self::Unavailable { .. } => ErrorKind::Unavailable,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }

    /// Wrap a connect-time error as `Unavailable` for `server`.
    ///
    /// Already-wrapped errors are returned unchanged.
    pub fn unavailable(server: &str, source: McpError) -> Self {
        match source {
            Self::Unavailable { .. } => source,
            other => Self::Unavailable {
                server: server.to_string(),
                source: Box::new(other),
            },
        }
    }
}

fn format_suggestions(suggestions: &[String]) -> String {
    if suggestions.is_empty() {
        String::new()
    } else {
        format!(" (did you mean: {}?)", suggestions.join(", "))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
