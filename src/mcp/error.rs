use std::time::Duration;

/// Everything that can go wrong between this client and an MCP server.
#[derive(Debug, thiserror::Error)]
pub enum McpError {
    /// Process failed to spawn or exited, pipe closed, HTTP refused or non-2xx.
    #[error("transport error: {0}")]
    Transport(String),
    /// The peer answered with something that is not the JSON-RPC we expected.
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("{operation} timed out after {}s", .after.as_secs_f32())]
    Timeout { operation: String, after: Duration },
    /// A well-formed JSON-RPC error object.
    #[error("server returned error {code}: {message}")]
    Rpc { code: i64, message: String },
    /// The remote tool ran and reported `isError: true`.
    #[error("remote tool failed: {0}")]
    RemoteTool(String),
    #[error("client is not ready (state: {state})")]
    NotReady { state: String },
    #[error("configuration error: {0}")]
    Config(String),
}

impl McpError {
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        McpError::Timeout {
            operation: operation.into(),
            after,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, McpError::Timeout { .. })
    }
}

impl From<std::io::Error> for McpError {
    fn from(err: std::io::Error) -> Self {
        McpError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for McpError {
    fn from(err: serde_json::Error) -> Self {
        McpError::Protocol(format!("invalid JSON: {}", err))
    }
}

impl From<reqwest::Error> for McpError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return McpError::Protocol(err.to_string());
        }
        McpError::Transport(err.to_string())
    }
}
