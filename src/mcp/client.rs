//! MCP client: one per configured server
//!
//! Owns the server subprocess (stdio and http transports) or a connection to
//! a pre-existing endpoint (external). Speaks JSON-RPC 2.0: `initialize`,
//! `notifications/initialized`, `tools/list`, `tools/call`. The handshake and
//! tool discovery happen exactly once at startup.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, warn};

use crate::config::McpServerConfig;
use crate::error::{CouncilError, CouncilResult};

const PROTOCOL_VERSION: &str = "2024-11-05";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const HTTP_STARTUP_ATTEMPTS: u32 = 10;

/// An immutable tool descriptor discovered from a server.
#[derive(Debug, Clone)]
pub struct McpTool {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub server_name: String,
}

impl McpTool {
    /// `server.tool` addressing used everywhere outside the client.
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.server_name, self.name)
    }
}

/// Transport seam: both subprocess-stdio and HTTP endpoints reduce to
/// request/notify.
#[async_trait]
trait McpTransport: Send + Sync {
    async fn request(&self, method: &str, params: Value) -> CouncilResult<Value>;
    async fn notify(&self, method: &str, params: Value) -> CouncilResult<()>;
    async fn shutdown(&self);
}

// ============================================================================
// Stdio transport
// ============================================================================

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;

/// JSON-RPC over a child process's stdin/stdout, newline-delimited.
///
/// A background reader task correlates incoming `id`s with waiting callers.
struct StdioTransport {
    child: Mutex<Option<Child>>,
    stdin: Mutex<ChildStdin>,
    pending: PendingMap,
    next_id: AtomicU64,
    server_name: String,
}

impl StdioTransport {
    async fn spawn(server_name: &str, command: &[String]) -> CouncilResult<Self> {
        let mut child = spawn_command(server_name, command)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| CouncilError::Unavailable(format!("{server_name} stdin")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CouncilError::Unavailable(format!("{server_name} stdout")))?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let reader_pending = pending.clone();
        let reader_name = server_name.to_string();

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let Ok(value) = serde_json::from_str::<Value>(&line) else {
                    continue;
                };
                // Replies carry the request id; server-initiated
                // notifications are ignored.
                let Some(id) = value.get("id").and_then(|v| v.as_u64()) else {
                    continue;
                };
                if let Some(tx) = reader_pending.lock().await.remove(&id) {
                    let _ = tx.send(value);
                }
            }
            debug!(server = reader_name, "stdio reader closed");
        });

        Ok(Self {
            child: Mutex::new(Some(child)),
            stdin: Mutex::new(stdin),
            pending,
            next_id: AtomicU64::new(1),
            server_name: server_name.to_string(),
        })
    }

    async fn write_line(&self, message: &Value) -> CouncilResult<()> {
        let mut line = serde_json::to_string(message)
            .map_err(|e| CouncilError::Parse(e.to_string()))?;
        line.push('\n');
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| CouncilError::transport(&self.server_name, e))?;
        stdin
            .flush()
            .await
            .map_err(|e| CouncilError::transport(&self.server_name, e))
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn request(&self, method: &str, params: Value) -> CouncilResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let message = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        if let Err(e) = self.write_line(&message).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        let reply = match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => {
                return Err(CouncilError::transport(
                    &self.server_name,
                    "reader task dropped before reply",
                ));
            }
            Err(_) => {
                self.pending.lock().await.remove(&id);
                return Err(CouncilError::timeout(&self.server_name, method));
            }
        };

        extract_rpc_result(&self.server_name, reply)
    }

    async fn notify(&self, method: &str, params: Value) -> CouncilResult<()> {
        let message = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        self.write_line(&message).await
    }

    async fn shutdown(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.kill().await;
        }
    }
}

// ============================================================================
// HTTP transport
// ============================================================================

/// JSON-RPC over HTTP. Used for locally spawned servers that listen on an
/// assigned port and for external servers at a configured URL.
struct HttpTransport {
    http: reqwest::Client,
    url: String,
    next_id: AtomicU64,
    child: Mutex<Option<Child>>,
    server_name: String,
}

impl HttpTransport {
    fn new(server_name: &str, url: String, child: Option<Child>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url,
            next_id: AtomicU64::new(1),
            child: Mutex::new(child),
            server_name: server_name.to_string(),
        }
    }
}

#[async_trait]
impl McpTransport for HttpTransport {
    async fn request(&self, method: &str, params: Value) -> CouncilResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let message = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response = self
            .http
            .post(&self.url)
            .timeout(REQUEST_TIMEOUT)
            .json(&message)
            .send()
            .await
            .map_err(|e| CouncilError::from_reqwest(&self.url, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CouncilError::transport(
                &self.url,
                format!("HTTP {status}: {body}"),
            ));
        }

        let reply: Value = response
            .json()
            .await
            .map_err(|e| CouncilError::Parse(format!("JSON-RPC reply: {e}")))?;

        extract_rpc_result(&self.server_name, reply)
    }

    async fn notify(&self, method: &str, params: Value) -> CouncilResult<()> {
        let message = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        self.http
            .post(&self.url)
            .timeout(REQUEST_TIMEOUT)
            .json(&message)
            .send()
            .await
            .map_err(|e| CouncilError::from_reqwest(&self.url, e))?;
        Ok(())
    }

    async fn shutdown(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.kill().await;
        }
    }
}

// ============================================================================
// Client
// ============================================================================

/// A connected MCP server with its discovered tool set.
pub struct McpClient {
    pub server_name: String,
    pub port: Option<u16>,
    pub tools: HashMap<String, McpTool>,
    transport: Box<dyn McpTransport>,
}

impl McpClient {
    /// Start a server from its catalog entry and run the handshake.
    ///
    /// `assigned_port` is used when the entry has no explicit port (http
    /// transport only). The registry is the sole caller.
    pub async fn start(
        config: &McpServerConfig,
        assigned_port: Option<u16>,
    ) -> CouncilResult<Self> {
        let name = config.name.clone();

        let (transport, port): (Box<dyn McpTransport>, Option<u16>) =
            if config.transport == "external" || config.url.is_some() {
                let url = config
                    .url
                    .clone()
                    .ok_or_else(|| CouncilError::Unavailable(format!("{name} url")))?;
                (Box::new(HttpTransport::new(&name, url, None)), None)
            } else if config.transport == "stdio" {
                (Box::new(StdioTransport::spawn(&name, &config.command).await?), None)
            } else {
                let port = config.port.or(assigned_port).ok_or_else(|| {
                    CouncilError::Unavailable(format!("{name} has no port assigned"))
                })?;
                let child = spawn_command(&name, &config.command)?;
                let url = format!("http://127.0.0.1:{port}/mcp");
                (Box::new(HttpTransport::new(&name, url, Some(child))), Some(port))
            };

        let mut client = Self {
            server_name: name,
            port,
            tools: HashMap::new(),
            transport,
        };

        client.handshake(config.transport == "http").await?;
        client.discover_tools().await?;
        Ok(client)
    }

    async fn handshake(&self, wait_for_listen: bool) -> CouncilResult<()> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "conclave",
                "version": env!("CARGO_PKG_VERSION"),
            },
        });

        // A freshly spawned http server needs a moment to bind its port.
        let attempts = if wait_for_listen { HTTP_STARTUP_ATTEMPTS } else { 1 };
        let mut last_err = None;
        for attempt in 0..attempts {
            match self.transport.request("initialize", params.clone()).await {
                Ok(_) => {
                    self.transport
                        .notify("notifications/initialized", json!({}))
                        .await?;
                    return Ok(());
                }
                Err(e) => {
                    last_err = Some(e);
                    if attempt + 1 < attempts {
                        tokio::time::sleep(Duration::from_millis(500)).await;
                    }
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| CouncilError::Unavailable(self.server_name.clone())))
    }

    async fn discover_tools(&mut self) -> CouncilResult<()> {
        let result = self.transport.request("tools/list", json!({})).await?;
        let tools = result
            .get("tools")
            .and_then(|t| t.as_array())
            .cloned()
            .unwrap_or_default();

        for tool in tools {
            let Some(name) = tool.get("name").and_then(|n| n.as_str()) else {
                continue;
            };
            let description = tool
                .get("description")
                .and_then(|d| d.as_str())
                .unwrap_or("")
                .to_string();
            let input_schema = tool
                .get("inputSchema")
                .cloned()
                .unwrap_or_else(|| json!({}));

            self.tools.insert(
                name.to_string(),
                McpTool {
                    name: name.to_string(),
                    description,
                    input_schema,
                    server_name: self.server_name.clone(),
                },
            );
        }

        debug!(
            server = self.server_name,
            tools = self.tools.len(),
            "discovered tools"
        );
        Ok(())
    }

    /// Invoke a tool by its short name. Returns the raw MCP result (the
    /// content envelope); errors surface as `CouncilError`.
    pub async fn call_tool(&self, tool: &str, arguments: Value) -> CouncilResult<Value> {
        self.transport
            .request(
                "tools/call",
                json!({
                    "name": tool,
                    "arguments": arguments,
                }),
            )
            .await
    }

    pub async fn stop(&self) {
        self.transport.shutdown().await;
    }
}

fn spawn_command(server_name: &str, command: &[String]) -> CouncilResult<Child> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| CouncilError::Unavailable(format!("{server_name} has no command")))?;

    Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            warn!(server = server_name, error = %e, "failed to spawn");
            CouncilError::Unavailable(format!("{server_name}: {e}"))
        })
}

fn extract_rpc_result(server_name: &str, reply: Value) -> CouncilResult<Value> {
    if let Some(error) = reply.get("error") {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("unknown JSON-RPC error");
        return Err(CouncilError::ToolFailed {
            tool: server_name.to_string(),
            detail: message.to_string(),
        });
    }
    Ok(reply.get("result").cloned().unwrap_or(Value::Null))
}
