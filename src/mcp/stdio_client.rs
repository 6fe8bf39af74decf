use super::error::McpError;
use super::protocol::{MCPMessage, MCPRequest, MCPResponse};
use super::transport::{MCPTransport, TransportKind};
use crate::config::{ClientSettings, ServerDescriptor};
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Longest stderr excerpt attached to a startup failure.
const STDERR_EXCERPT_LIMIT: usize = 2000;

/// JSON-RPC over a child process's stdin/stdout, one message per line.
pub struct StdioTransport {
    server_name: String,
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    startup_grace: Duration,
    shutdown_grace: Duration,
    process: Option<ServerProcess>,
    pending: PendingRequests,
}

struct ServerProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    stderr_task: Option<JoinHandle<()>>,
}

/// Request ids written to the server and not yet answered, with their method.
#[derive(Debug, Default)]
struct PendingRequests {
    ids: HashMap<u64, String>,
}

impl PendingRequests {
    fn insert(&mut self, id: u64, method: &str) {
        self.ids.insert(id, method.to_string());
    }

    fn remove(&mut self, id: u64) -> Option<String> {
        self.ids.remove(&id)
    }

    fn clear(&mut self) {
        self.ids.clear();
    }
}

impl StdioTransport {
    pub fn new(server_name: &str, descriptor: &ServerDescriptor, settings: &ClientSettings) -> Self {
        Self {
            server_name: server_name.to_string(),
            command: descriptor.command.clone(),
            args: descriptor.args.clone(),
            env: descriptor.env.clone(),
            startup_grace: settings.startup_grace(),
            shutdown_grace: settings.shutdown_grace(),
            process: None,
            pending: PendingRequests::default(),
        }
    }

    pub fn process_id(&self) -> Option<u32> {
        self.process.as_ref().and_then(|process| process.child.id())
    }

    async fn shutdown_process(&mut self) -> Result<(), McpError> {
        self.pending.clear();
        match self.process.take() {
            Some(process) => process.shutdown(self.server_name.clone(), self.shutdown_grace).await,
            None => Ok(()),
        }
    }
}

impl ServerProcess {
    async fn write_line(&mut self, line: &str) -> Result<(), McpError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| McpError::Transport("server stdin is closed".to_string()))?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String, McpError> {
        let mut line = String::new();
        let read = self.stdout.read_line(&mut line).await?;
        if read == 0 {
            return Err(McpError::Transport(
                "server closed stdout (process exited?)".to_string(),
            ));
        }
        Ok(line)
    }

    /// Closes stdin, waits out the grace window, then kills.
    async fn shutdown(mut self, server_name: String, grace: Duration) -> Result<(), McpError> {
        drop(self.stdin.take());

        let result = match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!("MCP server {} exited with {}", server_name, status);
                Ok(())
            }
            Ok(Err(e)) => {
                warn!("Failed to wait for MCP server {}: {}, killing it", server_name, e);
                self.kill(&server_name).await
            }
            Err(_) => {
                warn!(
                    "MCP server {} did not exit within {}s, killing it",
                    server_name,
                    grace.as_secs_f32()
                );
                self.kill(&server_name).await
            }
        };

        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
        result
    }

    async fn kill(&mut self, server_name: &str) -> Result<(), McpError> {
        self.child.kill().await.map_err(|e| {
            McpError::Transport(format!("failed to kill MCP server {}: {}", server_name, e))
        })
    }
}

/// Shuts the process down if a request future is dropped before it completes.
struct InFlight<'a> {
    slot: &'a mut Option<ServerProcess>,
    server_name: &'a str,
    grace: Duration,
    armed: bool,
}

impl<'a> InFlight<'a> {
    fn new(slot: &'a mut Option<ServerProcess>, server_name: &'a str, grace: Duration) -> Self {
        Self {
            slot,
            server_name,
            grace,
            armed: true,
        }
    }

    fn process(&mut self) -> Result<&mut ServerProcess, McpError> {
        self.slot
            .as_mut()
            .ok_or_else(|| McpError::Transport("server process is not running".to_string()))
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Some(mut process) = self.slot.take() else {
            return;
        };
        warn!("Request to MCP server {} was abandoned, stopping the process", self.server_name);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(process.shutdown(self.server_name.to_string(), self.grace));
            }
            Err(_) => {
                let _ = process.child.start_kill();
            }
        }
    }
}

/// Writes one request and reads lines until its response shows up.
async fn exchange(
    process: &mut ServerProcess,
    pending: &mut PendingRequests,
    server_name: &str,
    line: &str,
    id: u64,
) -> Result<MCPResponse, McpError> {
    debug!("MCP -> {}: {}", server_name, line.trim_end());
    process.write_line(line).await?;

    loop {
        let raw = process.read_line().await?;
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        debug!("MCP <- {}: {}", server_name, raw);

        match MCPMessage::decode_line(raw)? {
            MCPMessage::Request(message) => {
                let Some(request_id) = message.id else {
                    debug!("Ignoring {} notification from {}", message.method, server_name);
                    continue;
                };
                // server-to-client requests are not supported
                let reply = MCPResponse::failure(Some(request_id), -32601, "Method not found");
                process.write_line(&MCPMessage::from(reply).encode_line()?).await?;
            }
            MCPMessage::Response(response) => match response.id {
                Some(response_id) if response_id == id => {
                    pending.remove(id);
                    return Ok(response);
                }
                None if response.error.is_some() => {
                    pending.remove(id);
                    return Ok(response);
                }
                Some(response_id) => match pending.remove(response_id) {
                    Some(method) => {
                        debug!("Discarding late {} response {} from {}", method, response_id, server_name);
                    }
                    None => {
                        return Err(McpError::Protocol(format!(
                            "response id {} matches no pending request",
                            response_id
                        )));
                    }
                },
                None => {
                    return Err(McpError::Protocol("response without id".to_string()));
                }
            },
        }
    }
}

async fn drain_stderr(server_name: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(server = %server_name, "stderr: {}", line);
    }
}

async fn read_stderr_on_failure(stderr: Option<ChildStderr>) -> String {
    let Some(mut stderr) = stderr else {
        return String::new();
    };

    let mut buf = String::new();
    match tokio::time::timeout(Duration::from_millis(500), stderr.read_to_string(&mut buf)).await {
        Ok(Ok(_)) => {
            if buf.len() > STDERR_EXCERPT_LIMIT {
                let mut cut = STDERR_EXCERPT_LIMIT;
                while !buf.is_char_boundary(cut) {
                    cut -= 1;
                }
                buf.truncate(cut);
                buf.push_str("...(truncated)");
            }
            buf
        }
        _ => String::new(),
    }
}

#[async_trait]
impl MCPTransport for StdioTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    async fn open(&mut self) -> Result<(), McpError> {
        if self.process.is_some() {
            return Ok(());
        }
        info!("Starting MCP server {}: {} {:?}", self.server_name, self.command, self.args);

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args);
        // inherited environment, overridden per server
        cmd.envs(&self.env);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            McpError::Transport(format!("failed to spawn '{}': {}", self.command, e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Transport("failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Transport("failed to capture stdout".to_string()))?;
        let stderr = child.stderr.take();

        tokio::time::sleep(self.startup_grace).await;

        if let Some(status) = child.try_wait()? {
            let excerpt = read_stderr_on_failure(stderr).await;
            let suffix = if excerpt.trim().is_empty() {
                String::new()
            } else {
                format!(" | stderr: {}", excerpt.trim())
            };
            return Err(McpError::Transport(format!(
                "'{}' exited immediately with {}{}",
                self.command, status, suffix
            )));
        }

        let stderr_task = stderr.map(|stderr| tokio::spawn(drain_stderr(self.server_name.clone(), stderr)));

        self.process = Some(ServerProcess {
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout),
            stderr_task,
        });
        Ok(())
    }

    async fn request(&mut self, request: MCPRequest, timeout: Duration) -> Result<MCPResponse, McpError> {
        let id = request
            .id
            .ok_or_else(|| McpError::Protocol(format!("{} request has no id", request.method)))?;
        let method = request.method.clone();
        let line = MCPMessage::from(request).encode_line()?;

        let outcome = {
            let mut in_flight = InFlight::new(&mut self.process, &self.server_name, self.shutdown_grace);
            let process = in_flight.process()?;
            self.pending.insert(id, &method);
            let outcome = tokio::time::timeout(
                timeout,
                exchange(process, &mut self.pending, &self.server_name, &line, id),
            )
            .await;
            in_flight.disarm();
            outcome
        };

        match outcome {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(McpError::Transport(reason))) => {
                warn!("MCP server {} pipe failed: {}", self.server_name, reason);
                if let Err(e) = self.shutdown_process().await {
                    warn!("{}", e);
                }
                Err(McpError::Transport(reason))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(
                    "MCP server {} did not answer {} within {}s",
                    self.server_name,
                    method,
                    timeout.as_secs_f32()
                );
                if let Err(e) = self.shutdown_process().await {
                    warn!("{}", e);
                }
                Err(McpError::timeout(method, timeout))
            }
        }
    }

    async fn notify(&mut self, notification: MCPRequest) -> Result<(), McpError> {
        let line = MCPMessage::from(notification).encode_line()?;
        debug!("MCP -> {}: {}", self.server_name, line.trim_end());

        let mut in_flight = InFlight::new(&mut self.process, &self.server_name, self.shutdown_grace);
        let result = in_flight.process()?.write_line(&line).await;
        in_flight.disarm();
        result
    }

    async fn close(&mut self) -> Result<(), McpError> {
        if self.process.is_some() {
            info!("Stopping MCP server {}", self.server_name);
        }
        self.shutdown_process().await
    }

    fn is_open(&self) -> bool {
        self.process.is_some()
    }
}
