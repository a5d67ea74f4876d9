//! MCP client: JSON-RPC over stdio for externally launched tool servers.
//!
//! This module handles:
//! - Launching server processes and owning them until they exit
//! - Line-delimited JSON-RPC 2.0 framing and request/response correlation
//! - One pooled connection per server, with serialized connects
//! - Discovering servers from other hosts' config files
//! - Validating and dispatching tool calls, with one normalized result shape

pub mod client;
pub mod discovery;
pub mod errors;
pub mod framing;
pub mod health;
pub mod pool;
pub mod process;
pub mod registry;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use client::{ConnectionStatus, ServerSummary, ToolInvoker};
pub use discovery::{ConfigSource, DiscoveryReport, DiscoveryScanner, SourceKind};
pub use errors::{ErrorKind, McpError};
pub use pool::TransportPool;
pub use registry::{Availability, ServerRegistry};
pub use transport::{Transport, TransportSettings};
pub use types::{ExecutionResult, ServerDefinition, ToolDescriptor, TransportState, TransportStatus};
