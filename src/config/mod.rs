use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How this client identifies itself and how long it waits on servers.
#[derive(Debug, Deserialize, Clone, Serialize, PartialEq)]
#[serde(default)]
pub struct ClientSettings {
    pub protocol_version: String,
    pub client_name: String,
    pub client_version: String,
    /// Deadline for `initialize` and `tools/list`.
    pub request_timeout_secs: u64,
    /// Deadline for `tools/call`; tool execution may be slow.
    pub call_timeout_secs: u64,
    /// How long a freshly spawned process must stay alive to count as started.
    pub startup_grace_ms: u64,
    /// Wait between closing a child's stdin and killing it.
    pub shutdown_grace_secs: u64,
    /// Path under the base URL that HTTP servers accept JSON-RPC on.
    pub endpoint_path: String,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            protocol_version: "2025-06-18".to_string(),
            client_name: "mcp_relay".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            request_timeout_secs: 30,
            call_timeout_secs: 120,
            startup_grace_ms: 1000,
            shutdown_grace_secs: 5,
            endpoint_path: "mcp".to_string(),
        }
    }
}

impl ClientSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

// Claude Desktop-style server entry
#[derive(Debug, Deserialize, Clone, Serialize, PartialEq, Default)]
pub struct ServerDescriptor {
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>, // Per-server environment overrides
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl ServerDescriptor {
    pub fn stdio(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            ..Default::default()
        }
    }

    pub fn http(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Default::default()
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// The base URL of an HTTP server: `url` if set, else `command`.
    pub fn base_url(&self) -> &str {
        self.url.as_deref().unwrap_or(&self.command).trim()
    }
}

#[derive(Debug, Deserialize, Clone, Serialize, Default)]
pub struct McpConfig {
    #[serde(rename = "mcpServers", default)]
    pub servers: HashMap<String, ServerDescriptor>,
}

#[derive(Debug, Deserialize, Clone, Serialize, Default)]
pub struct AppConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub servers_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    #[serde(default)]
    pub client: ClientSettings,
}

impl AppConfig {
    fn config_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("mcp_relay")
    }

    pub fn default_config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Layers the TOML file (if present) under `MCP_RELAY__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(Self::default_config_path);

        let config = Config::builder()
            .add_source(File::from(config_path.clone()).required(path.is_some()))
            .add_source(
                Environment::with_prefix("MCP_RELAY")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to read config {}", config_path.display()))?;

        config
            .try_deserialize()
            .with_context(|| format!("Invalid config {}", config_path.display()))
    }

    pub fn servers_path(&self) -> PathBuf {
        self.servers_file
            .clone()
            .unwrap_or_else(|| Self::config_dir().join("mcp_config.json"))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to render config as TOML")
    }
}

impl McpConfig {
    /// Load server descriptors from a JSON file (Claude Desktop format).
    /// A missing file means no servers.
    pub fn load_from_json(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!("No MCP server file at {}, starting without servers", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut config: McpConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        config.expand_env_vars();

        Ok(config)
    }

    /// Expand environment variables in format ${env:VAR_NAME}
    fn expand_env_vars(&mut self) {
        for descriptor in self.servers.values_mut() {
            descriptor.command = Self::expand_env_var_string(&descriptor.command);

            descriptor.args = descriptor
                .args
                .iter()
                .map(|arg| Self::expand_env_var_string(arg))
                .collect();

            descriptor.env = descriptor
                .env
                .iter()
                .map(|(k, v)| (k.clone(), Self::expand_env_var_string(v)))
                .collect();

            descriptor.url = descriptor
                .url
                .as_deref()
                .map(Self::expand_env_var_string);
        }
    }

    fn expand_env_var_string(value: &str) -> String {
        let mut result = value.to_string();
        let mut search_from = 0;

        while let Some(offset) = result[search_from..].find("${env:") {
            let start = search_from + offset;
            let Some(end) = result[start..].find('}') else {
                break;
            };
            let var_name = &result[start + 6..start + end];
            let env_value = std::env::var(var_name).unwrap_or_default();
            result.replace_range(start..start + end + 1, &env_value);
            // never re-expand text that came out of a variable
            search_from = start + env_value.len();
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_expand_env_var_string() {
        std::env::set_var("MCP_RELAY_TEST_TOKEN", "s3cret");
        assert_eq!(
            McpConfig::expand_env_var_string("Bearer ${env:MCP_RELAY_TEST_TOKEN}!"),
            "Bearer s3cret!"
        );
        assert_eq!(McpConfig::expand_env_var_string("${env:MCP_RELAY_TEST_UNSET_VAR}"), "");
        assert_eq!(McpConfig::expand_env_var_string("${env:broken"), "${env:broken");
    }

    #[test]
    fn test_load_servers_file() {
        std::env::set_var("MCP_RELAY_TEST_HOST", "localhost:8080");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "mcpServers": {{
                    "wazuh": {{ "command": "http://${{env:MCP_RELAY_TEST_HOST}}" }},
                    "local": {{ "command": "python", "args": ["server.py"], "env": {{ "LEVEL": "debug" }} }}
                }}
            }}"#
        )
        .unwrap();

        let config = McpConfig::load_from_json(file.path()).unwrap();
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.servers["wazuh"].base_url(), "http://localhost:8080");
        assert_eq!(config.servers["local"].args, vec!["server.py"]);
        assert_eq!(config.servers["local"].env["LEVEL"], "debug");
    }

    #[test]
    fn test_missing_servers_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let config = McpConfig::load_from_json(&dir.path().join("absent.json")).unwrap();
        assert!(config.servers.is_empty());
    }

    #[test]
    fn test_load_app_config_from_toml() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            "servers_file = \"/etc/mcp.json\"\n\n[client]\nstartup_grace_ms = 250\nclient_name = \"soc-console\"\n"
        )
        .unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.client.startup_grace(), Duration::from_millis(250));
        assert_eq!(config.client.client_name, "soc-console");
        assert_eq!(config.client.request_timeout_secs, 30);
        assert_eq!(config.servers_path(), PathBuf::from("/etc/mcp.json"));
        assert!(config.to_toml().unwrap().contains("startup_grace_ms = 250"));
    }

    // the only test touching MCP_RELAY__CLIENT__CALL_TIMEOUT_SECS
    #[test]
    fn test_environment_overrides_config_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(file, "[client]\ncall_timeout_secs = 300\nclient_name = \"soc-console\"\n").unwrap();

        std::env::set_var("MCP_RELAY__CLIENT__CALL_TIMEOUT_SECS", "45");
        let config = AppConfig::load(Some(file.path()));
        std::env::remove_var("MCP_RELAY__CLIENT__CALL_TIMEOUT_SECS");

        let config = config.unwrap();
        assert_eq!(config.client.call_timeout(), Duration::from_secs(45));
        assert_eq!(config.client.client_name, "soc-console");
    }
}
