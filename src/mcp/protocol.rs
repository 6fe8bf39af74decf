use super::error::McpError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_INITIALIZED: &str = "notifications/initialized";
pub const METHOD_TOOLS_LIST: &str = "tools/list";
pub const METHOD_TOOLS_CALL: &str = "tools/call";

/// A request, or a notification when `id` is absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MCPRequest {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MCPResponse {
    pub jsonrpc: String,
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Any single JSON-RPC document seen on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MCPMessage {
    Request(MCPRequest),
    Response(MCPResponse),
}

impl MCPRequest {
    pub fn new(id: u64, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            method: method.to_string(),
            params,
        }
    }

    pub fn notification(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: method.to_string(),
            params,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    pub fn initialize(id: u64, protocol_version: &str, client_name: &str, client_version: &str) -> Self {
        Self::new(
            id,
            METHOD_INITIALIZE,
            Some(serde_json::json!({
                "protocolVersion": protocol_version,
                "capabilities": {
                    "sampling": {},
                    "roots": { "listChanged": true }
                },
                "clientInfo": {
                    "name": client_name,
                    "version": client_version
                }
            })),
        )
    }

    pub fn initialized() -> Self {
        Self::notification(METHOD_INITIALIZED, None)
    }

    pub fn tools_list(id: u64) -> Self {
        Self::new(id, METHOD_TOOLS_LIST, Some(serde_json::json!({})))
    }

    pub fn tools_call(id: u64, name: &str, arguments: Value) -> Self {
        Self::new(
            id,
            METHOD_TOOLS_CALL,
            Some(serde_json::json!({
                "name": name,
                "arguments": arguments
            })),
        )
    }
}

impl MCPResponse {
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Option<u64>, code: i64, message: &str) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.to_string(),
                data: None,
            }),
        }
    }

    /// The `result` member, or the taxonomy error the response stands for.
    pub fn into_result(self) -> Result<Value, McpError> {
        if let Some(error) = self.error {
            return Err(McpError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        self.result
            .ok_or_else(|| McpError::Protocol("response has neither result nor error".to_string()))
    }
}

impl MCPMessage {
    /// Single-line JSON followed by `\n`.
    pub fn encode_line(&self) -> Result<String, McpError> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    pub fn decode_line(line: &str) -> Result<Self, McpError> {
        let message: MCPMessage = serde_json::from_str(line.trim())?;
        if let MCPMessage::Response(ref response) = message {
            if response.result.is_none() && response.error.is_none() {
                return Err(McpError::Protocol(format!(
                    "message is neither a request nor a response: {}",
                    line.trim()
                )));
            }
        }
        Ok(message)
    }
}

impl From<MCPRequest> for MCPMessage {
    fn from(request: MCPRequest) -> Self {
        MCPMessage::Request(request)
    }
}

impl From<MCPResponse> for MCPMessage {
    fn from(response: MCPResponse) -> Self {
        MCPMessage::Response(response)
    }
}

/// Metadata for one remotely invocable tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", alias = "parameters", default)]
    pub parameters: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Payload of non-text blocks (`data`, `mimeType`, `resource`, ...).
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "text".to_string(),
            text: Some(text.into()),
            extra: serde_json::Map::new(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        if self.kind == "text" {
            self.text.as_deref()
        } else {
            None
        }
    }
}

/// Outcome of one `tools/call`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationResult {
    pub content: Vec<ContentBlock>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

impl InvocationResult {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::text(message)],
            is_error: true,
        }
    }

    pub fn texts(&self) -> Vec<&str> {
        self.content.iter().filter_map(ContentBlock::as_text).collect()
    }

    pub fn text(&self) -> String {
        self.texts().join("\n")
    }

    pub fn into_result(self) -> Result<Vec<ContentBlock>, McpError> {
        if self.is_error {
            return Err(McpError::RemoteTool(self.text()));
        }
        Ok(self.content)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion", default)]
    pub protocol_version: Option<String>,
    #[serde(rename = "serverInfo", default)]
    pub server_info: Option<Value>,
    #[serde(default)]
    pub capabilities: Option<Value>,
}

impl InitializeResult {
    pub fn parse(result: Value) -> Result<Self, McpError> {
        if !result.is_object() {
            return Err(McpError::Protocol(format!(
                "initialize result is not an object: {}",
                result
            )));
        }
        Ok(serde_json::from_value(result)?)
    }
}

/// Pulls the descriptors out of a `tools/list` result; malformed entries are skipped.
pub fn parse_tools(result: Value) -> Result<Vec<ToolDescriptor>, McpError> {
    let tools = result
        .get("tools")
        .and_then(|t| t.as_array())
        .ok_or_else(|| McpError::Protocol("tools/list result has no tools array".to_string()))?;

    let mut descriptors = Vec::with_capacity(tools.len());
    for tool in tools {
        match serde_json::from_value::<ToolDescriptor>(tool.clone()) {
            Ok(descriptor) => descriptors.push(descriptor),
            Err(e) => tracing::warn!("Skipping malformed tool descriptor {}: {}", tool, e),
        }
    }
    Ok(descriptors)
}

pub fn parse_invocation(result: Value) -> Result<InvocationResult, McpError> {
    serde_json::from_value(result)
        .map_err(|e| McpError::Protocol(format!("tools/call result has no content blocks: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn round_trip(message: MCPMessage) {
        let line = message.encode_line().unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        assert_eq!(MCPMessage::decode_line(&line).unwrap(), message);
    }

    #[test]
    fn test_envelopes_survive_the_line_codec() {
        round_trip(MCPRequest::tools_call(7, "get_x", json!({"id": "1", "note": "a\nb"})).into());
        round_trip(MCPRequest::initialized().into());
        round_trip(MCPResponse::success(3, json!({"tools": []})).into());
        round_trip(MCPResponse::failure(Some(4), -32601, "Method not found").into());
        round_trip(MCPResponse::failure(None, -32700, "Parse error").into());
    }

    #[test]
    fn test_notification_has_no_id_on_the_wire() {
        let line = MCPMessage::from(MCPRequest::initialized()).encode_line().unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value, json!({"jsonrpc": "2.0", "method": "notifications/initialized"}));
    }

    #[test]
    fn test_initialize_params_declare_client() {
        let request = MCPRequest::initialize(1, "2025-06-18", "mcp_relay", "0.1.0");
        let params = request.params.unwrap();
        assert_eq!(params["protocolVersion"], "2025-06-18");
        assert_eq!(params["capabilities"], json!({"sampling": {}, "roots": {"listChanged": true}}));
        assert_eq!(params["clientInfo"]["name"], "mcp_relay");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(MCPMessage::decode_line("not json"), Err(McpError::Protocol(_))));
        assert!(matches!(
            MCPMessage::decode_line(r#"{"jsonrpc":"2.0","id":1}"#),
            Err(McpError::Protocol(_))
        ));
    }

    #[test]
    fn test_into_result_maps_rpc_errors() {
        let err = MCPResponse::failure(Some(1), -32602, "bad params").into_result().unwrap_err();
        assert!(matches!(err, McpError::Rpc { code: -32602, .. }));
    }

    #[test]
    fn test_parse_tools_accepts_both_schema_keys() {
        let tools = parse_tools(json!({
            "tools": [
                {"name": "a", "description": "first", "inputSchema": {"type": "object"}},
                {"name": "b", "parameters": {"type": "object"}},
                {"description": "no name"}
            ]
        }))
        .unwrap();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].parameters, json!({"type": "object"}));
        assert_eq!(tools[1].description, "");
        assert_eq!(tools[1].parameters, json!({"type": "object"}));
    }

    #[test]
    fn test_parse_invocation() {
        let result = parse_invocation(json!({
            "content": [
                {"type": "text", "text": "ok"},
                {"type": "image", "data": "AAAA", "mimeType": "image/png"}
            ]
        }))
        .unwrap();
        assert!(!result.is_error);
        assert_eq!(result.texts(), vec!["ok"]);
        assert_eq!(result.content[1].extra["mimeType"], "image/png");

        assert!(parse_invocation(json!({"isError": true})).is_err());
    }

    #[test]
    fn test_failed_invocation_into_result() {
        let err = InvocationResult::failure("boom").into_result().unwrap_err();
        assert!(matches!(err, McpError::RemoteTool(ref msg) if msg == "boom"));
    }
}
