#![allow(dead_code)]

use mcp_relay::config::{ClientSettings, ServerDescriptor};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Line-oriented MCP server in POSIX sh. Answers initialize, tools/list and
/// tools/call; appends every received line to `$MCP_LOG` when set; never
/// answers tools/call when `$MCP_HANG_ON_CALL` is set.
const ECHO_SERVER: &str = r#"
tool="${MCP_TOOL:-get_x}"
while IFS= read -r line; do
  if [ -n "$MCP_LOG" ]; then printf '%s\n' "$line" >> "$MCP_LOG"; fi
  id=$(printf '%s\n' "$line" | sed -n 's/^{"jsonrpc":"2.0","id":\([0-9]*\),.*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2025-06-18","serverInfo":{"name":"echo"}}}\n' "$id" ;;
    *'"method":"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"%s","description":"Echo x","inputSchema":{"type":"object"}}]}}\n' "$id" "$tool" ;;
    *'"method":"tools/call"'*)
      if [ -n "$MCP_HANG_ON_CALL" ]; then exec sleep 60; fi
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"ok"}]}}\n' "$id" ;;
  esac
done
"#;

pub fn echo_server() -> ServerDescriptor {
    ServerDescriptor::stdio("sh", vec!["-c".to_string(), ECHO_SERVER.to_string()])
}

pub fn settings() -> ClientSettings {
    ClientSettings {
        startup_grace_ms: 100,
        request_timeout_secs: 5,
        call_timeout_secs: 5,
        shutdown_grace_secs: 1,
        ..ClientSettings::default()
    }
}

/// One request as seen by [`MockHttpServer`].
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub method: String,
    pub session: Option<String>,
    pub path: String,
}

#[derive(Debug, Clone, Copy)]
pub enum HttpBehavior {
    Healthy,
    FailInitialize,
}

pub const SESSION_ID: &str = "sess-1";

/// A local MCP endpoint served by tiny_http on its own thread.
pub struct MockHttpServer {
    pub url: String,
    pub seen: Arc<Mutex<Vec<SeenRequest>>>,
    server: Arc<tiny_http::Server>,
    worker: Option<JoinHandle<()>>,
}

impl MockHttpServer {
    pub fn start(behavior: HttpBehavior) -> Self {
        let server = Arc::new(tiny_http::Server::http("127.0.0.1:0").unwrap());
        let port = server.server_addr().to_ip().unwrap().port();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let worker = {
            let server = server.clone();
            let seen = seen.clone();
            std::thread::spawn(move || {
                for mut request in server.incoming_requests() {
                    let mut body = String::new();
                    let _ = request.as_reader().read_to_string(&mut body);
                    let message: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
                    let method = message["method"].as_str().unwrap_or("").to_string();
                    let session = request
                        .headers()
                        .iter()
                        .find(|h| h.field.equiv("mcp-session-id"))
                        .map(|h| h.value.as_str().to_string());
                    seen.lock().unwrap().push(SeenRequest {
                        method: method.clone(),
                        session: session.clone(),
                        path: request.url().to_string(),
                    });

                    let (status, reply) = respond(behavior, &method, &message, session.as_deref());
                    let mut response = tiny_http::Response::from_string(reply)
                        .with_status_code(tiny_http::StatusCode(status))
                        .with_header(header("Content-Type", "application/json"));
                    if method == "initialize" && status == 200 {
                        response = response.with_header(header("Mcp-Session-Id", SESSION_ID));
                    }
                    let _ = request.respond(response);
                }
            })
        };

        Self {
            url: format!("http://127.0.0.1:{}", port),
            seen,
            server,
            worker: Some(worker),
        }
    }

    pub fn methods(&self) -> Vec<String> {
        self.seen.lock().unwrap().iter().map(|r| r.method.clone()).collect()
    }
}

impl Drop for MockHttpServer {
    fn drop(&mut self) {
        self.server.unblock();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn header(name: &str, value: &str) -> tiny_http::Header {
    tiny_http::Header::from_bytes(name.as_bytes(), value.as_bytes()).unwrap()
}

fn respond(behavior: HttpBehavior, method: &str, message: &Value, session: Option<&str>) -> (u16, String) {
    let id = message["id"].clone();
    if id.is_null() {
        return (202, String::new());
    }
    let result = match method {
        "initialize" => {
            if let HttpBehavior::FailInitialize = behavior {
                return (500, "internal server error".to_string());
            }
            json!({"protocolVersion": "2025-06-18", "serverInfo": {"name": "wazuh"}})
        }
        _ if session != Some(SESSION_ID) => return (400, "missing session".to_string()),
        "tools/list" => json!({
            "tools": [
                {"name": "get_wazuh_agents", "description": "List agents", "inputSchema": {"type": "object"}},
                {"name": "get_wazuh_alert_summary", "description": "Alert summary", "inputSchema": {"type": "object"}}
            ]
        }),
        "tools/call" => {
            if message["params"]["name"] == "slow" {
                std::thread::sleep(Duration::from_secs(3));
            }
            json!({"content": [{"type": "text", "text": format!("called {}", message["params"]["name"].as_str().unwrap_or(""))}]})
        }
        _ => return (200, json!({"jsonrpc": "2.0", "id": id, "error": {"code": -32601, "message": "Method not found"}}).to_string()),
    };
    (200, json!({"jsonrpc": "2.0", "id": id, "result": result}).to_string())
}
