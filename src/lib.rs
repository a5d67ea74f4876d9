//! Host-side runtime for stdio MCP tool servers.
//!
//! Discovers servers declared in other tools' config files, launches them on
//! demand, keeps one JSON-RPC connection per server, and runs tool calls
//! through [`ToolInvoker`](mcp_client::ToolInvoker).

pub mod config;
pub mod logging;
pub mod mcp_client;

pub use config::HostConfig;
pub use mcp_client::{ExecutionResult, McpError, ToolInvoker};

/// Platform-standard data directory for toolhost state and logs.
///
/// - macOS: `~/Library/Application Support/toolhost/`
/// - Windows: `{FOLDERID_RoamingAppData}\toolhost\`
/// - Linux: `$XDG_DATA_HOME/toolhost/` (fallback `~/.local/share/toolhost/`)
///
/// Falls back to `~/.toolhost/` only if none of the above can be resolved.
pub fn data_dir() -> std::path::PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("toolhost");
    }
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".toolhost")
}

/// Default log directory, `<data_dir>/logs`.
pub fn default_log_dir() -> std::path::PathBuf {
    data_dir().join("logs")
}
