use super::client::{ClientState, MCPClient};
use super::protocol::ToolDescriptor;
use crate::config::{ClientSettings, McpConfig, ServerDescriptor};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// Named, handshaked MCP clients. A client is only ever stored once `connect`
/// has succeeded, and is evicted once it stops being ready.
pub struct MCPServerRegistry {
    settings: ClientSettings,
    servers: RwLock<HashMap<String, Arc<MCPClient>>>,
    failures: RwLock<HashMap<String, String>>, // server_name -> last connect error
}

impl MCPServerRegistry {
    pub fn new(settings: ClientSettings) -> Self {
        Self {
            settings,
            servers: RwLock::new(HashMap::new()),
            failures: RwLock::new(HashMap::new()),
        }
    }

    /// Connects to every configured server concurrently; returns how many
    /// were registered. Failures are logged and recorded, never fatal.
    pub async fn initialize_from_config(&self, mcp_config: &McpConfig) -> usize {
        let attempts = mcp_config
            .servers
            .iter()
            .map(|(name, descriptor)| self.add_server(name, descriptor));
        let connected = join_all(attempts).await.into_iter().filter(|ok| *ok).count();

        info!(
            "Connected to {} of {} MCP servers",
            connected,
            mcp_config.servers.len()
        );
        connected
    }

    /// Connects a new client and registers it under `name`, tearing down any
    /// previous client with that name. On failure nothing is registered.
    pub async fn add_server(&self, name: &str, descriptor: &ServerDescriptor) -> bool {
        let client = MCPClient::new(name, descriptor, self.settings.clone());

        if !client.connect().await {
            let reason = client
                .last_error()
                .await
                .unwrap_or_else(|| "connection failed".to_string());
            client.close().await;
            error!("MCP server {} was not registered: {}", name, reason);
            self.failures.write().await.insert(name.to_string(), reason);
            return false;
        }

        let previous = self
            .servers
            .write()
            .await
            .insert(name.to_string(), Arc::new(client));
        self.failures.write().await.remove(name);
        // closed outside the map lock
        if let Some(previous) = previous {
            info!("Replacing MCP server {}", name);
            previous.close().await;
        }

        info!("Registered MCP server {}", name);
        true
    }

    /// Drops clients whose connection went away (timeout, dead pipe, closed
    /// by their holder) and records why in `failures`.
    async fn evict_lost(&self) {
        let lost: Vec<String> = self
            .servers
            .read()
            .await
            .iter()
            .filter(|(_, client)| !client.is_ready())
            .map(|(name, _)| name.clone())
            .collect();
        if lost.is_empty() {
            return;
        }

        let mut servers = self.servers.write().await;
        let mut failures = self.failures.write().await;
        for name in lost {
            // may have been replaced since the read
            let Some(client) = servers.get(&name) else {
                continue;
            };
            let state = client.state();
            if state == ClientState::Ready {
                continue;
            }
            servers.remove(&name);
            warn!("Evicting MCP server {}: client is {}", name, state);
            failures.insert(name, format!("connection lost (client {})", state));
        }
    }

    pub async fn get(&self, name: &str) -> Option<Arc<MCPClient>> {
        self.evict_lost().await;
        self.servers
            .read()
            .await
            .get(name)
            .filter(|client| client.is_ready())
            .cloned()
    }

    pub async fn all(&self) -> HashMap<String, Arc<MCPClient>> {
        self.evict_lost().await;
        self.servers
            .read()
            .await
            .iter()
            .filter(|(_, client)| client.is_ready())
            .map(|(name, client)| (name.clone(), client.clone()))
            .collect()
    }

    pub async fn server_names(&self) -> Vec<String> {
        self.evict_lost().await;
        let mut names: Vec<String> = self.servers.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn len(&self) -> usize {
        self.evict_lost().await;
        self.servers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Server name -> reason for every server that failed to connect or was
    /// evicted after losing its connection.
    pub async fn failures(&self) -> HashMap<String, String> {
        self.evict_lost().await;
        self.failures.read().await.clone()
    }

    /// Lists tools on every registered server at once. A server whose
    /// discovery fails reports an empty list; one whose connection is lost
    /// during discovery is evicted and left out.
    pub async fn list_all(&self) -> HashMap<String, Vec<ToolDescriptor>> {
        let clients = self.all().await;
        let discoveries = clients.into_iter().map(|(name, client)| async move {
            let tools = client.list_tools().await;
            client.is_ready().then_some((name, tools))
        });
        let listed = join_all(discoveries).await.into_iter().flatten().collect();
        self.evict_lost().await;
        listed
    }

    pub async fn remove_server(&self, name: &str) -> bool {
        let removed = self.servers.write().await.remove(name);
        match removed {
            Some(client) => {
                client.close().await;
                info!("Removed MCP server {}", name);
                true
            }
            None => {
                warn!("Cannot remove unknown MCP server {}", name);
                false
            }
        }
    }

    pub async fn close_all(&self) {
        let drained: Vec<Arc<MCPClient>> = self.servers.write().await.drain().map(|(_, c)| c).collect();
        join_all(drained.iter().map(|client| client.close())).await;
    }
}
