// RAGO MCP - Tool host for child-process tool servers
//
// Servers are spawned (eagerly or on first use), handshaken over stdio with
// JSON-RPC 2.0, and supervised with capped exponential-backoff restarts.
// Their tools are merged into one catalog that the orchestrator and the
// agent runtime call through.

pub mod cache;
mod catalog;
pub mod codec;
pub mod config;
pub mod events;
pub mod host;
pub mod inprocess;
pub mod launcher;
pub mod protocol;
pub mod schema;
mod session;
mod supervisor;

pub use cache::NO_CACHE_FIELD;
pub use codec::{Framing, JsonRpcCodec};
pub use config::{McpConfig, ServerConfig};
pub use events::ToolEvent;
pub use host::{ServerStatus, ToolHost, ToolRequest};
pub use inprocess::{remote_tool, DuplexLauncher, FnToolHandler, Reply, ToolHandler};
pub use launcher::{Connection, Launcher, ProcessLauncher};
pub use protocol::RemoteTool;
pub use schema::validate_arguments;
