use super::error::McpError;
use super::http_client::HttpTransport;
use super::protocol::{MCPRequest, MCPResponse};
use super::stdio_client::StdioTransport;
use crate::config::{ClientSettings, ServerDescriptor};
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

/// Moves one JSON-RPC message to a server and, for requests, one back.
#[async_trait]
pub trait MCPTransport: Send {
    fn kind(&self) -> TransportKind;
    async fn open(&mut self) -> Result<(), McpError>;
    async fn request(&mut self, request: MCPRequest, timeout: Duration) -> Result<MCPResponse, McpError>;
    async fn notify(&mut self, notification: MCPRequest) -> Result<(), McpError>;
    /// Releases the process or session. Safe to call more than once.
    async fn close(&mut self) -> Result<(), McpError>;
    fn is_open(&self) -> bool;

    fn session_token(&self) -> Option<&str> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Stdio,
    Http,
}

impl TransportKind {
    /// HTTP when the descriptor carries a URL, or its command is one; stdio otherwise.
    pub fn resolve(descriptor: &ServerDescriptor) -> Self {
        if descriptor.url.is_some() || looks_like_url(&descriptor.command) {
            TransportKind::Http
        } else {
            TransportKind::Stdio
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Stdio => write!(f, "stdio"),
            TransportKind::Http => write!(f, "http"),
        }
    }
}

fn looks_like_url(command: &str) -> bool {
    let command = command.trim().to_ascii_lowercase();
    command.starts_with("http://") || command.starts_with("https://")
}

pub enum Connection {
    Stdio(StdioTransport),
    Http(HttpTransport),
}

impl Connection {
    pub fn new(server_name: &str, descriptor: &ServerDescriptor, settings: &ClientSettings) -> Self {
        match TransportKind::resolve(descriptor) {
            TransportKind::Stdio => Connection::Stdio(StdioTransport::new(server_name, descriptor, settings)),
            TransportKind::Http => Connection::Http(HttpTransport::new(server_name, descriptor, settings)),
        }
    }
}

#[async_trait]
impl MCPTransport for Connection {
    fn kind(&self) -> TransportKind {
        match self {
            Connection::Stdio(transport) => transport.kind(),
            Connection::Http(transport) => transport.kind(),
        }
    }

    async fn open(&mut self) -> Result<(), McpError> {
        match self {
            Connection::Stdio(transport) => transport.open().await,
            Connection::Http(transport) => transport.open().await,
        }
    }

    async fn request(&mut self, request: MCPRequest, timeout: Duration) -> Result<MCPResponse, McpError> {
        match self {
            Connection::Stdio(transport) => transport.request(request, timeout).await,
            Connection::Http(transport) => transport.request(request, timeout).await,
        }
    }

    async fn notify(&mut self, notification: MCPRequest) -> Result<(), McpError> {
        match self {
            Connection::Stdio(transport) => transport.notify(notification).await,
            Connection::Http(transport) => transport.notify(notification).await,
        }
    }

    async fn close(&mut self) -> Result<(), McpError> {
        match self {
            Connection::Stdio(transport) => transport.close().await,
            Connection::Http(transport) => transport.close().await,
        }
    }

    fn is_open(&self) -> bool {
        match self {
            Connection::Stdio(transport) => transport.is_open(),
            Connection::Http(transport) => transport.is_open(),
        }
    }

    fn session_token(&self) -> Option<&str> {
        match self {
            Connection::Stdio(transport) => transport.session_token(),
            Connection::Http(transport) => transport.session_token(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_selects_http_for_urls() {
        assert_eq!(TransportKind::resolve(&ServerDescriptor::stdio("http://localhost:8080", vec![])), TransportKind::Http);
        assert_eq!(TransportKind::resolve(&ServerDescriptor::stdio(" HTTPS://siem.example.com ", vec![])), TransportKind::Http);
        assert_eq!(TransportKind::resolve(&ServerDescriptor::http("localhost:8080")), TransportKind::Http);
    }

    #[test]
    fn test_resolve_selects_stdio_for_commands() {
        assert_eq!(TransportKind::resolve(&ServerDescriptor::stdio("/bin/echo-mcp", vec![])), TransportKind::Stdio);
        assert_eq!(
            TransportKind::resolve(&ServerDescriptor::stdio("uvx", vec!["http-mcp-server".to_string()])),
            TransportKind::Stdio
        );
        assert_eq!(TransportKind::resolve(&ServerDescriptor::stdio("./httpd-bridge", vec![])), TransportKind::Stdio);
    }

    #[test]
    fn test_connection_follows_resolution() {
        let settings = ClientSettings::default();
        let http = Connection::new("siem", &ServerDescriptor::http("http://localhost:8080"), &settings);
        assert_eq!(http.kind(), TransportKind::Http);
        assert!(!http.is_open());

        let stdio = Connection::new("local", &ServerDescriptor::stdio("python", vec![]), &settings);
        assert_eq!(stdio.kind(), TransportKind::Stdio);
        assert!(!stdio.is_open());
    }
}
