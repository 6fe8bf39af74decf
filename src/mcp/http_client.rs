use super::error::McpError;
use super::protocol::{MCPMessage, MCPRequest, MCPResponse};
use super::transport::{MCPTransport, TransportKind};
use crate::config::{ClientSettings, ServerDescriptor};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

pub const SESSION_HEADER: &str = "mcp-session-id";

/// JSON-RPC over HTTP POST to `<base URL>/<endpoint path>`.
pub struct HttpTransport {
    server_name: String,
    base_url: String,
    endpoint_path: String,
    notify_timeout: Duration,
    http: Option<reqwest::Client>,
    endpoint: Option<Url>,
    session_id: Option<String>,
}

impl HttpTransport {
    pub fn new(server_name: &str, descriptor: &ServerDescriptor, settings: &ClientSettings) -> Self {
        Self {
            server_name: server_name.to_string(),
            base_url: descriptor.base_url().to_string(),
            endpoint_path: settings.endpoint_path.clone(),
            notify_timeout: settings.request_timeout(),
            http: None,
            endpoint: None,
            session_id: None,
        }
    }

    fn endpoint_url(&self) -> Result<Url, McpError> {
        let base = Url::parse(&self.base_url)
            .map_err(|e| McpError::Config(format!("invalid server URL '{}': {}", self.base_url, e)))?;
        if base.scheme() != "http" && base.scheme() != "https" {
            return Err(McpError::Config(format!(
                "unsupported URL scheme '{}' for {}",
                base.scheme(),
                self.server_name
            )));
        }
        let joined = format!(
            "{}/{}",
            base.as_str().trim_end_matches('/'),
            self.endpoint_path.trim_start_matches('/')
        );
        Url::parse(&joined).map_err(|e| McpError::Config(format!("invalid endpoint '{}': {}", joined, e)))
    }

    async fn post(&mut self, message: &MCPMessage, method: &str, timeout: Duration) -> Result<reqwest::Response, McpError> {
        let (Some(http), Some(endpoint)) = (self.http.as_ref(), self.endpoint.as_ref()) else {
            return Err(McpError::Transport(format!("HTTP session to {} is not open", self.server_name)));
        };
        debug!(
            "MCP -> {} ({}): {}",
            self.server_name,
            endpoint,
            serde_json::to_string(message).unwrap_or_default()
        );

        let mut request = http
            .post(endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json, text/event-stream")
            .timeout(timeout)
            .json(message);
        if let Some(session_id) = &self.session_id {
            request = request.header(SESSION_HEADER, session_id);
        }

        let response = request.send().await.map_err(|e| classify(e, method, timeout))?;

        if let Some(session_id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|value| value.to_str().ok())
        {
            if self.session_id.as_deref() != Some(session_id) {
                debug!("MCP server {} issued session {}", self.server_name, session_id);
                self.session_id = Some(session_id.to_string());
            }
        }

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(McpError::Transport(format!("HTTP {}: {}", status.as_u16(), body.trim())));
        }
        Ok(response)
    }
}

fn classify(err: reqwest::Error, method: &str, timeout: Duration) -> McpError {
    if err.is_timeout() {
        McpError::timeout(method, timeout)
    } else {
        err.into()
    }
}

/// Data of the first event in a `text/event-stream` body.
fn first_sse_data(body: &str) -> Option<String> {
    let mut data_lines: Vec<&str> = Vec::new();

    for line in body.split('\n') {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            if !data_lines.is_empty() {
                break;
            }
            continue;
        }
        if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.trim_start());
        }
    }

    if data_lines.is_empty() {
        None
    } else {
        Some(data_lines.join("\n"))
    }
}

fn decode_body(content_type: &str, body: &str) -> Result<MCPMessage, McpError> {
    if content_type.starts_with("text/event-stream") {
        let data = first_sse_data(body)
            .ok_or_else(|| McpError::Protocol("event stream carried no data".to_string()))?;
        return MCPMessage::decode_line(&data);
    }
    MCPMessage::decode_line(body)
}

#[async_trait]
impl MCPTransport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn open(&mut self) -> Result<(), McpError> {
        if self.http.is_some() {
            return Ok(());
        }
        let endpoint = self.endpoint_url()?;
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| McpError::Transport(format!("failed to build HTTP client: {}", e)))?;

        info!("Using HTTP MCP server {} at {}", self.server_name, endpoint);
        self.endpoint = Some(endpoint);
        self.http = Some(http);
        Ok(())
    }

    async fn request(&mut self, request: MCPRequest, timeout: Duration) -> Result<MCPResponse, McpError> {
        let id = request
            .id
            .ok_or_else(|| McpError::Protocol(format!("{} request has no id", request.method)))?;
        let method = request.method.clone();

        let response = self.post(&MCPMessage::from(request), &method, timeout).await?;
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = response.text().await.map_err(|e| classify(e, &method, timeout))?;
        debug!("MCP <- {}: {}", self.server_name, body.trim());

        match decode_body(&content_type, &body)? {
            MCPMessage::Response(response) if response.id == Some(id) || response.id.is_none() => Ok(response),
            MCPMessage::Response(response) => Err(McpError::Protocol(format!(
                "response id {:?} does not match request id {}",
                response.id, id
            ))),
            MCPMessage::Request(message) => Err(McpError::Protocol(format!(
                "expected a response to {}, got {}",
                method, message.method
            ))),
        }
    }

    async fn notify(&mut self, notification: MCPRequest) -> Result<(), McpError> {
        let method = notification.method.clone();
        // notifications are acknowledged with 202 or an ignorable 2xx body
        let timeout = self.notify_timeout;
        self.post(&MCPMessage::from(notification), &method, timeout)
            .await
            .map(|_| ())
    }

    async fn close(&mut self) -> Result<(), McpError> {
        self.http = None;
        self.endpoint = None;
        self.session_id = None;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.http.is_some()
    }

    fn session_token(&self) -> Option<&str> {
        self.session_id.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport(url: &str) -> HttpTransport {
        HttpTransport::new("siem", &ServerDescriptor::http(url), &ClientSettings::default())
    }

    #[test]
    fn test_endpoint_joins_fixed_path() {
        assert_eq!(
            transport("http://localhost:8080").endpoint_url().unwrap().as_str(),
            "http://localhost:8080/mcp"
        );
        assert_eq!(
            transport("https://siem.example.com/api/").endpoint_url().unwrap().as_str(),
            "https://siem.example.com/api/mcp"
        );
    }

    #[test]
    fn test_endpoint_rejects_bad_urls() {
        assert!(matches!(transport("localhost:8080").endpoint_url(), Err(McpError::Config(_))));
        assert!(matches!(transport("not a url").endpoint_url(), Err(McpError::Config(_))));
    }

    #[test]
    fn test_first_sse_data() {
        let body = "event: message\ndata: {\"jsonrpc\":\"2.0\",\ndata: \"id\":1}\n\ndata: second\n\n";
        assert_eq!(first_sse_data(body).unwrap(), "{\"jsonrpc\":\"2.0\",\n\"id\":1}");
        assert!(first_sse_data(": keep-alive\n\n").is_none());
    }

    #[test]
    fn test_decode_sse_body() {
        let body = "event: message\r\ndata: {\"jsonrpc\":\"2.0\",\"id\":3,\"result\":{}}\r\n\r\n";
        let message = decode_body("text/event-stream", body).unwrap();
        assert!(matches!(message, MCPMessage::Response(ref r) if r.id == Some(3)));
    }

    #[tokio::test]
    async fn test_request_before_open_fails() {
        let mut transport = transport("http://localhost:8080");
        let err = transport
            .request(MCPRequest::tools_list(1), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Transport(_)));
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut transport = transport(&format!("http://127.0.0.1:{}", port));
        transport.open().await.unwrap();
        let err = transport
            .request(MCPRequest::tools_list(1), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Transport(_)));
    }
}
