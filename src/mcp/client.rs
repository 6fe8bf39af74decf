use super::error::McpError;
use super::protocol::{
    parse_invocation, parse_tools, InitializeResult, InvocationResult, MCPRequest, ToolDescriptor,
};
use super::transport::{Connection, MCPTransport, TransportKind};
use crate::config::{ClientSettings, ServerDescriptor};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Handshaking,
    Ready,
    Failed,
    Closed,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClientState::Disconnected => "disconnected",
            ClientState::Connecting => "connecting",
            ClientState::Handshaking => "handshaking",
            ClientState::Ready => "ready",
            ClientState::Failed => "failed",
            ClientState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// One MCP server: owns its transport, runs the handshake, lists and calls tools.
///
/// Requests are serialized by the session lock, so at most one is in flight
/// per connection. The state is readable without that lock.
pub struct MCPClient<T: MCPTransport = Connection> {
    name: String,
    settings: ClientSettings,
    state: watch::Sender<ClientState>,
    session: Mutex<Session<T>>,
}

struct Session<T> {
    transport: T,
    next_id: u64,
    server_info: Option<Value>,
    last_error: Option<String>,
}

impl<T> Session<T> {
    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

impl MCPClient<Connection> {
    pub fn new(name: &str, descriptor: &ServerDescriptor, settings: ClientSettings) -> Self {
        let connection = Connection::new(name, descriptor, &settings);
        Self::with_transport(name, connection, settings)
    }
}

impl<T: MCPTransport> MCPClient<T> {
    pub fn with_transport(name: &str, transport: T, settings: ClientSettings) -> Self {
        let (state, _) = watch::channel(ClientState::Disconnected);
        Self {
            name: name.to_string(),
            settings,
            state,
            session: Mutex::new(Session {
                transport,
                next_id: 1,
                server_info: None,
                last_error: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state; never waits on an in-flight request.
    pub fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ClientState::Ready
    }

    fn set_state(&self, state: ClientState) {
        self.state.send_replace(state);
    }

    pub async fn transport_kind(&self) -> TransportKind {
        self.session.lock().await.transport.kind()
    }

    /// `serverInfo` from the initialize result.
    pub async fn server_info(&self) -> Option<Value> {
        self.session.lock().await.server_info.clone()
    }

    pub async fn session_token(&self) -> Option<String> {
        self.session.lock().await.transport.session_token().map(str::to_string)
    }

    /// Why the last connect or request failed, if it did.
    pub async fn last_error(&self) -> Option<String> {
        self.session.lock().await.last_error.clone()
    }

    /// Opens the transport and runs the handshake. A client that fails here
    /// is released and must be discarded.
    pub async fn connect(&self) -> bool {
        let mut session = self.session.lock().await;
        let state = self.state();
        if state != ClientState::Disconnected {
            warn!("MCP client {} cannot connect from state {}", self.name, state);
            return false;
        }

        match self.handshake(&mut session).await {
            Ok(()) => {
                self.set_state(ClientState::Ready);
                info!("Connected to MCP server {}", self.name);
                true
            }
            Err(e) => {
                error!("Failed to connect to MCP server {}: {}", self.name, e);
                self.set_state(ClientState::Failed);
                session.last_error = Some(e.to_string());
                if let Err(close_err) = session.transport.close().await {
                    warn!("Failed to release MCP server {}: {}", self.name, close_err);
                }
                false
            }
        }
    }

    async fn handshake(&self, session: &mut Session<T>) -> Result<(), McpError> {
        self.set_state(ClientState::Connecting);
        session.transport.open().await?;

        self.set_state(ClientState::Handshaking);
        let id = session.next_id();
        let request = MCPRequest::initialize(
            id,
            &self.settings.protocol_version,
            &self.settings.client_name,
            &self.settings.client_version,
        );
        let response = session
            .transport
            .request(request, self.settings.request_timeout())
            .await?;
        let init = InitializeResult::parse(response.into_result()?)?;
        debug!(
            "MCP server {} info: {:?} (protocol {:?})",
            self.name, init.server_info, init.protocol_version
        );
        session.server_info = init.server_info;

        session.transport.notify(MCPRequest::initialized()).await?;
        Ok(())
    }

    /// Tools the server offers; empty when not ready or on any failure.
    pub async fn list_tools(&self) -> Vec<ToolDescriptor> {
        let mut session = self.session.lock().await;
        let timeout = self.settings.request_timeout();
        let result = self
            .send(&mut session, MCPRequest::tools_list, timeout)
            .await
            .and_then(parse_tools);

        match result {
            Ok(tools) => {
                info!("MCP server {} offers {} tools", self.name, tools.len());
                tools
            }
            Err(e) => {
                warn!("Tool discovery on MCP server {} failed: {}", self.name, e);
                session.last_error = Some(e.to_string());
                Vec::new()
            }
        }
    }

    /// Invokes a remote tool. Never fails: every failure comes back as an
    /// error-flagged result with a text block describing it.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> InvocationResult {
        let mut session = self.session.lock().await;
        let timeout = self.settings.call_timeout();
        debug!("Calling tool {} on {} with {}", name, self.name, arguments);

        let result = self
            .send(&mut session, |id| MCPRequest::tools_call(id, name, arguments), timeout)
            .await
            .and_then(parse_invocation);

        match result {
            Ok(invocation) => {
                if invocation.is_error {
                    warn!("Tool {} on {} reported an error: {}", name, self.name, invocation.text());
                }
                invocation
            }
            Err(e) => {
                warn!("Tool {} on {} failed: {}", name, self.name, e);
                session.last_error = Some(e.to_string());
                InvocationResult::failure(format!("Error calling tool {}: {}", name, e))
            }
        }
    }

    async fn send(
        &self,
        session: &mut Session<T>,
        build: impl FnOnce(u64) -> MCPRequest,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        let state = self.state();
        if state != ClientState::Ready {
            return Err(McpError::NotReady {
                state: state.to_string(),
            });
        }

        let id = session.next_id();
        let outcome = session.transport.request(build(id), timeout).await;
        if outcome.is_err() && !session.transport.is_open() {
            // the transport released itself (dead pipe or timeout)
            info!("MCP server {} connection is gone, client closed", self.name);
            self.set_state(ClientState::Closed);
        }
        outcome?.into_result()
    }

    /// Releases the transport. Safe to call in any state and more than once.
    pub async fn close(&self) {
        let mut session = self.session.lock().await;
        if let Err(e) = session.transport.close().await {
            warn!("Failed to close MCP server {}: {}", self.name, e);
        }
        if self.state() != ClientState::Failed {
            self.set_state(ClientState::Closed);
        }
    }
}
