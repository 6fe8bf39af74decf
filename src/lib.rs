//! Client for MCP tool servers reached over a child process's stdio or over HTTP.
//!
//! [`mcp::MCPServerRegistry`] connects named servers described by
//! [`config::ServerDescriptor`]s, keeps the ones that complete the handshake,
//! and lets callers discover and invoke their tools.

pub mod config;
pub mod mcp;

pub use config::{AppConfig, ClientSettings, McpConfig, ServerDescriptor};
pub use mcp::{InvocationResult, MCPClient, MCPServerRegistry, McpError, ToolDescriptor, ToolIndex};
