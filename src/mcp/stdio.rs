use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use super::jsonrpc::{self, Incoming};
use super::{MCP_PROTOCOL_VERSION, McpServer, McpTool, McpToolOutput};
use crate::{Error, Result};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
const MAX_TOOL_PAGES: usize = 64;

/// How to launch the tool server process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct McpStdioParams {
    pub command: String,
    pub args: Vec<String>,
    /// Applied on top of the inherited environment.
    pub env: BTreeMap<String, String>,
}

struct StdioConnection {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl StdioConnection {
    async fn send(&mut self, message: &Value) -> Result<()> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|err| Error::Mcp(format!("write to server stdin failed: {err}")))?;
        self.stdin
            .flush()
            .await
            .map_err(|err| Error::Mcp(format!("flush server stdin failed: {err}")))
    }

    async fn read_response(&mut self, server: &str, id: i64) -> Result<Value> {
        loop {
            let line = self
                .stdout
                .next_line()
                .await
                .map_err(|err| Error::Mcp(format!("read from server stdout failed: {err}")))?
                .ok_or_else(|| Error::Mcp(format!("server {server} closed its stdout")))?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Ok(message) = serde_json::from_str::<Value>(line) else {
                tracing::debug!(server, line, "ignoring non-json line from mcp server");
                continue;
            };

            match jsonrpc::classify(message) {
                Incoming::Response {
                    id: response_id,
                    outcome,
                } if response_id == id => return outcome.into_result(),
                Incoming::Response {
                    id: response_id, ..
                } => {
                    tracing::debug!(server, response_id, expected = id, "dropping stale response");
                }
                Incoming::Request { id: request_id, method } => {
                    let reply = if method == "ping" {
                        jsonrpc::result(request_id, serde_json::json!({}))
                    } else {
                        jsonrpc::method_not_found(request_id, &method)
                    };
                    self.send(&reply).await?;
                }
                Incoming::Notification { method } => {
                    tracing::debug!(server, method = %method, "mcp notification");
                }
                Incoming::Unrecognized => {
                    tracing::debug!(server, "ignoring unrecognized mcp message");
                }
            }
        }
    }

    async fn shutdown(mut self, server: &str) {
        // closing stdin is the stdio transport's shutdown signal
        drop(self.stdin);
        match tokio::time::timeout(SHUTDOWN_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => tracing::debug!(server, %status, "mcp server exited"),
            Ok(Err(err)) => tracing::warn!(server, error = %err, "waiting for mcp server failed"),
            Err(_) => {
                tracing::debug!(server, "mcp server did not exit in time; killing");
                if let Err(err) = self.child.kill().await {
                    tracing::warn!(server, error = %err, "failed to kill mcp server");
                }
            }
        }
    }
}

/// An MCP server launched as a child process.
///
/// The process is spawned by [`McpServer::connect`] and released by
/// [`McpServer::cleanup`]. `kill_on_drop` covers the case where neither runs.
pub struct McpServerStdio {
    name: String,
    params: McpStdioParams,
    cache_tools_list: bool,
    request_timeout: Duration,
    connection: Mutex<Option<StdioConnection>>,
    tools_cache: Mutex<Option<Vec<McpTool>>>,
    server_info: std::sync::Mutex<Option<Value>>,
    next_id: AtomicI64,
    closed: AtomicBool,
}

impl std::fmt::Debug for McpServerStdio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let env_keys: Vec<&str> = self.params.env.keys().map(String::as_str).collect();
        f.debug_struct("McpServerStdio")
            .field("name", &self.name)
            .field("command", &self.params.command)
            .field("args", &self.params.args)
            .field("env_keys", &env_keys)
            .field("cache_tools_list", &self.cache_tools_list)
            .finish()
    }
}

impl McpServerStdio {
    pub fn new(name: impl Into<String>, params: McpStdioParams) -> Self {
        Self {
            name: name.into(),
            params,
            cache_tools_list: false,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connection: Mutex::new(None),
            tools_cache: Mutex::new(None),
            server_info: std::sync::Mutex::new(None),
            next_id: AtomicI64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_cache_tools_list(mut self, cache_tools_list: bool) -> Self {
        self.cache_tools_list = cache_tools_list;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        if !timeout.is_zero() {
            self.request_timeout = timeout;
        }
        self
    }

    pub fn params(&self) -> &McpStdioParams {
        &self.params
    }

    /// `serverInfo` from the initialize handshake, once connected.
    pub fn server_info(&self) -> Option<Value> {
        self.server_info
            .lock()
            .ok()
            .and_then(|info| info.as_ref().cloned())
    }

    pub async fn invalidate_tools_cache(&self) {
        self.tools_cache.lock().await.take();
    }

    fn spawn(&self) -> Result<StdioConnection> {
        let command = self.params.command.trim();
        if command.is_empty() {
            return Err(Error::Mcp(format!(
                "server {} has an empty start command",
                self.name
            )));
        }

        let mut cmd = Command::new(command);
        cmd.args(&self.params.args)
            .envs(&self.params.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|err| {
            Error::Mcp(format!(
                "failed to spawn server {} ({command}): {err}",
                self.name
            ))
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Mcp("server stdin is not piped".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Mcp("server stdout is not piped".to_string()))?;

        Ok(StdioConnection {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        })
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let mut guard = self.connection.lock().await;
        let connection = guard
            .as_mut()
            .ok_or_else(|| Error::Mcp(format!("server {} is not connected", self.name)))?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let exchange = async {
            connection
                .send(&jsonrpc::request(id, method, params))
                .await?;
            connection.read_response(&self.name, id).await
        };
        let Ok(outcome) = tokio::time::timeout(self.request_timeout, exchange).await else {
            // stdin may hold half a line; nothing sent after it would parse
            if let Some(connection) = guard.take() {
                connection.shutdown(&self.name).await;
            }
            tracing::warn!(server = %self.name, method, "mcp request timed out; connection dropped");
            return Err(Error::Mcp(format!(
                "server {} did not answer {method} within {}s",
                self.name,
                self.request_timeout.as_secs_f64()
            )));
        };
        outcome
    }

    async fn handshake(&self) -> Result<()> {
        let result = self
            .request(
                "initialize",
                serde_json::json!({
                    "protocolVersion": MCP_PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": env!("CARGO_PKG_NAME"),
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                }),
            )
            .await?;

        let server_version = result
            .get("protocolVersion")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if server_version != MCP_PROTOCOL_VERSION {
            tracing::debug!(
                server = %self.name,
                server_version,
                "mcp server negotiated a different protocol version"
            );
        }
        if let Ok(mut info) = self.server_info.lock() {
            *info = result.get("serverInfo").cloned();
        }

        let mut guard = self.connection.lock().await;
        let connection = guard
            .as_mut()
            .ok_or_else(|| Error::Mcp(format!("server {} is not connected", self.name)))?;
        connection
            .send(&jsonrpc::notification("notifications/initialized"))
            .await
    }

    async fn fetch_tools(&self) -> Result<Vec<McpTool>> {
        let mut tools = Vec::<McpTool>::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_TOOL_PAGES {
            let params = match cursor.as_deref() {
                Some(cursor) => serde_json::json!({ "cursor": cursor }),
                None => serde_json::json!({}),
            };
            let result = self.request("tools/list", params).await?;

            let page = result
                .get("tools")
                .and_then(Value::as_array)
                .ok_or_else(|| {
                    Error::InvalidResponse(format!(
                        "tools/list result from server {} has no tools array",
                        self.name
                    ))
                })?;
            for tool in page {
                tools.push(serde_json::from_value(tool.clone())?);
            }

            let next = result
                .get("nextCursor")
                .and_then(Value::as_str)
                .filter(|next| !next.is_empty())
                .map(str::to_string);
            if next.is_none() || next == cursor {
                return Ok(tools);
            }
            cursor = next;
        }

        tracing::warn!(server = %self.name, "tools/list pagination did not terminate; truncating");
        Ok(tools)
    }
}

#[async_trait]
impl McpServer for McpServerStdio {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Mcp(format!(
                "server {} was already cleaned up",
                self.name
            )));
        }
        {
            let mut guard = self.connection.lock().await;
            if guard.is_some() {
                return Err(Error::Mcp(format!(
                    "server {} is already connected",
                    self.name
                )));
            }
            *guard = Some(self.spawn()?);
        }

        tracing::info!(
            server = %self.name,
            command = %self.params.command,
            args = ?self.params.args,
            "mcp server spawned"
        );

        if let Err(err) = self.handshake().await {
            if let Some(connection) = self.connection.lock().await.take() {
                connection.shutdown(&self.name).await;
            }
            return Err(err);
        }
        Ok(())
    }

    async fn list_tools(&self) -> Result<Vec<McpTool>> {
        if self.cache_tools_list {
            if let Some(cached) = self.tools_cache.lock().await.as_ref() {
                return Ok(cached.clone());
            }
        }

        let tools = self.fetch_tools().await?;
        tracing::debug!(server = %self.name, count = tools.len(), "listed mcp tools");
        if self.cache_tools_list {
            *self.tools_cache.lock().await = Some(tools.clone());
        }
        Ok(tools)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<McpToolOutput> {
        let arguments = match arguments {
            Value::Null => serde_json::json!({}),
            other => other,
        };
        let result = self
            .request(
                "tools/call",
                serde_json::json!({ "name": name, "arguments": arguments }),
            )
            .await?;
        Ok(McpToolOutput::from_call_result(&result))
    }

    async fn cleanup(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.tools_cache.lock().await.take();
        let Some(connection) = self.connection.lock().await.take() else {
            return Ok(());
        };
        connection.shutdown(&self.name).await;
        tracing::info!(server = %self.name, "mcp server cleaned up");
        Ok(())
    }
}
