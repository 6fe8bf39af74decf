use super::protocol::{InvocationResult, ToolDescriptor};
use super::registry::MCPServerRegistry;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteTool {
    pub server: String,
    pub descriptor: ToolDescriptor,
}

/// Table of every remote tool by name, dispatched through one generic call path.
#[derive(Debug, Default)]
pub struct ToolIndex {
    tools: HashMap<String, RemoteTool>, // tool_name -> owning server + descriptor
    enabled_tools: HashMap<String, bool>, // tool_name -> enabled
}

impl ToolIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the table from the registry. When two servers expose the same
    /// tool name, the server that sorts first keeps it.
    pub async fn refresh(&mut self, registry: &MCPServerRegistry) {
        let discovered = registry.list_all().await;
        self.load(discovered);
    }

    fn load(&mut self, discovered: HashMap<String, Vec<ToolDescriptor>>) {
        let mut servers: Vec<_> = discovered.into_iter().collect();
        servers.sort_by(|a, b| a.0.cmp(&b.0));

        self.tools.clear();
        for (server, descriptors) in servers {
            for descriptor in descriptors {
                if let Some(existing) = self.tools.get(&descriptor.name) {
                    warn!(
                        "Tool {} on {} is shadowed by the one on {}",
                        descriptor.name, server, existing.server
                    );
                    continue;
                }
                debug!("MCP server {} tool: {}", server, descriptor.name);
                // Enable new tools by default
                self.enabled_tools.entry(descriptor.name.clone()).or_insert(true);
                self.tools.insert(
                    descriptor.name.clone(),
                    RemoteTool {
                        server: server.clone(),
                        descriptor,
                    },
                );
            }
        }
        self.enabled_tools.retain(|name, _| self.tools.contains_key(name));
    }

    pub fn get(&self, tool_name: &str) -> Option<&RemoteTool> {
        self.tools.get(tool_name)
    }

    pub fn server_for_tool(&self, tool_name: &str) -> Option<&str> {
        self.tools.get(tool_name).map(|tool| tool.server.as_str())
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn available_tools(&self) -> Vec<&RemoteTool> {
        let mut tools: Vec<&RemoteTool> = self.tools.values().collect();
        tools.sort_by(|a, b| a.descriptor.name.cmp(&b.descriptor.name));
        tools
    }

    pub fn enabled_tools(&self) -> Vec<&RemoteTool> {
        self.available_tools()
            .into_iter()
            .filter(|tool| self.is_tool_enabled(&tool.descriptor.name))
            .collect()
    }

    pub fn is_tool_enabled(&self, tool_name: &str) -> bool {
        self.enabled_tools.get(tool_name).copied().unwrap_or(true)
    }

    pub fn set_tool_enabled(&mut self, tool_name: &str, enabled: bool) {
        self.enabled_tools.insert(tool_name.to_string(), enabled);
    }

    pub fn enable_all(&mut self) {
        for name in self.tools.keys() {
            self.enabled_tools.insert(name.clone(), true);
        }
    }

    pub fn disable_all(&mut self) {
        for name in self.tools.keys() {
            self.enabled_tools.insert(name.clone(), false);
        }
    }

    /// Calls a tool by name on whichever server owns it.
    pub async fn invoke(&self, registry: &MCPServerRegistry, tool_name: &str, arguments: Value) -> InvocationResult {
        let Some(tool) = self.tools.get(tool_name) else {
            return InvocationResult::failure(format!("Unknown tool: {}", tool_name));
        };
        if !self.is_tool_enabled(tool_name) {
            return InvocationResult::failure(format!("Tool {} is disabled", tool_name));
        }
        match registry.get(&tool.server).await {
            Some(client) => client.call_tool(tool_name, arguments).await,
            None => InvocationResult::failure(format!(
                "MCP server {} for tool {} is not registered",
                tool.server, tool_name
            )),
        }
    }
}
