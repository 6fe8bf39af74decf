pub mod client;
pub mod error;
pub mod http_client;
pub mod protocol;
pub mod registry;
pub mod stdio_client;
pub mod tools;
pub mod transport;

pub use client::{ClientState, MCPClient};
pub use error::McpError;
pub use protocol::{ContentBlock, InvocationResult, ToolDescriptor};
pub use registry::MCPServerRegistry;
pub use tools::{RemoteTool, ToolIndex};
pub use transport::{Connection, MCPTransport, TransportKind};
