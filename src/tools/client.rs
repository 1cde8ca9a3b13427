//! JSON-RPC 2.0 client for one tool server
//!
//! Stdio servers are spawned as child processes and spoken to with one JSON
//! message per line. HTTP servers get one POST per request. Both perform the
//! `initialize` handshake and list their tools on connect.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::oneshot;

use super::config::{ToolServerConfig, TransportKind};
use crate::{Error, Result};

/// Per-request deadline
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Protocol revision sent in `initialize`
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Tool advertised by a server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "inputSchema", skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

/// Result of `tools/call`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ToolCallOutput {
    #[serde(default)]
    pub content: Vec<ToolContent>,
    #[serde(default, rename = "isError")]
    pub is_error: bool,
}

/// One content item of a tool result
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ToolContent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
}

impl ToolCallOutput {
    /// Text items joined by newlines
    #[must_use]
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| c.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    #[serde(default)]
    message: Option<String>,
}

impl RpcResponse {
    fn into_result(self) -> Result<Value> {
        if let Some(error) = self.error {
            let message = error.message.unwrap_or_else(|| "unknown error".to_string());
            return Err(Error::Tool(format!("MCP error: {message}")));
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

type Reply = Result<Value>;

/// Outstanding requests keyed by id
///
/// Ids come from a monotonically increasing counter and are never reused, so
/// a reply arriving after its request timed out finds no entry and is dropped.
#[derive(Debug, Default)]
pub(crate) struct RequestTable {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
}

impl RequestTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<Reply>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register(&self) -> (u64, oneshot::Receiver<Reply>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id, tx);
        (id, rx)
    }

    /// Complete a request; false when nobody is waiting for `id`
    pub(crate) fn resolve(&self, id: u64, reply: Reply) -> bool {
        let sender = self.lock().remove(&id);
        sender.is_some_and(|tx| tx.send(reply).is_ok())
    }

    pub(crate) fn remove(&self, id: u64) {
        self.lock().remove(&id);
    }

    pub(crate) fn fail_all(&self, reason: &str) {
        for (_, tx) in self.lock().drain() {
            let _ = tx.send(Err(Error::Tool(reason.to_string())));
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}

/// Route one stdout line to its waiting request
fn dispatch_line(table: &RequestTable, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    let response = match serde_json::from_str::<RpcResponse>(line) {
        Ok(r) => r,
        Err(_) => {
            tracing::trace!(line, "skipping non-JSON output from tool server");
            return;
        }
    };

    // Server-initiated notifications carry no id
    let Some(id) = response.id else {
        return;
    };

    if !table.resolve(id, response.into_result()) {
        tracing::debug!(id, "dropping reply for unknown or expired request");
    }
}

struct StdioTransport {
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    child: tokio::sync::Mutex<Option<Child>>,
    table: Arc<RequestTable>,
    exited: Arc<AtomicBool>,
    timeout: Duration,
}

impl StdioTransport {
    fn spawn(config: &ToolServerConfig, connected: Arc<AtomicBool>, timeout: Duration) -> Result<Self> {
        let command = config
            .command
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| {
                Error::Tool(format!(
                    "MCP server \"{}\": no command specified for stdio transport",
                    config.name
                ))
            })?;

        let mut child = Command::new(command)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Tool(format!("failed to spawn MCP server \"{}\": {e}", config.name)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Tool("tool server has no stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Tool("tool server has no stdout".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            let server = config.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(server = %server, "stderr: {line}");
                }
            });
        }

        let table = Arc::new(RequestTable::default());
        let exited = Arc::new(AtomicBool::new(false));
        tokio::spawn(read_responses(
            config.name.clone(),
            stdout,
            Arc::clone(&table),
            Arc::clone(&exited),
            connected,
        ));

        Ok(Self {
            stdin: tokio::sync::Mutex::new(Some(stdin)),
            child: tokio::sync::Mutex::new(Some(child)),
            table,
            exited,
            timeout,
        })
    }

    async fn write_line(&self, line: &str) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| Error::Tool("MCP server not running".to_string()))?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let (id, rx) = self.table.register();

        // The reader fails every pending entry on exit; catch entries added after that
        if self.exited.load(Ordering::SeqCst) {
            self.table.remove(id);
            return Err(Error::Tool("MCP server exited".to_string()));
        }

        let line = serde_json::to_string(&RpcRequest {
            jsonrpc: "2.0",
            id: Some(id),
            method,
            params,
        })?;
        if let Err(e) = self.write_line(&line).await {
            self.table.remove(id);
            return Err(e);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(Error::Tool(format!("MCP server disconnected: {method}"))),
            Err(_) => {
                self.table.remove(id);
                Err(Error::Tool(format!("MCP request timeout: {method}")))
            }
        }
    }

    async fn notify(&self, method: &str, params: Value) -> Result<()> {
        let line = serde_json::to_string(&RpcRequest {
            jsonrpc: "2.0",
            id: None,
            method,
            params,
        })?;
        self.write_line(&line).await
    }

    async fn shutdown(&self) {
        self.stdin.lock().await.take();
        if let Some(mut child) = self.child.lock().await.take()
            && let Err(e) = child.kill().await
        {
            tracing::debug!(error = %e, "tool server already gone");
        }
        self.table.fail_all("MCP server disconnected");
    }
}

async fn read_responses(
    server: String,
    stdout: ChildStdout,
    table: Arc<RequestTable>,
    exited: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => dispatch_line(&table, &line),
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(server = %server, error = %e, "failed reading tool server output");
                break;
            }
        }
    }

    exited.store(true, Ordering::SeqCst);
    connected.store(false, Ordering::SeqCst);
    table.fail_all("MCP server exited");
    tracing::info!(server = %server, "tool server process exited");
}

struct HttpTransport {
    client: reqwest::Client,
    url: String,
    next_id: AtomicU64,
    timeout: Duration,
}

impl HttpTransport {
    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let body = RpcRequest {
            jsonrpc: "2.0",
            id: Some(id),
            method,
            params,
        };

        let resp = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Tool(format!("MCP request timeout: {method}"))
                } else {
                    Error::Tool(format!("MCP HTTP error: {e}"))
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::Tool(format!("HTTP {}: {text}", status.as_u16())));
        }

        let response: RpcResponse = resp
            .json()
            .await
            .map_err(|e| Error::Tool(format!("invalid MCP response: {e}")))?;
        response.into_result()
    }
}

enum Transport {
    Stdio(StdioTransport),
    Http(HttpTransport),
}

/// Live connection to one tool server
pub struct ToolClient {
    config: ToolServerConfig,
    transport: Transport,
    connected: Arc<AtomicBool>,
    tools: Vec<ToolInfo>,
}

impl ToolClient {
    /// Connect, handshake, and discover tools
    ///
    /// # Errors
    ///
    /// Returns error if the server cannot be started or reached, or the
    /// handshake fails
    pub async fn connect(config: ToolServerConfig) -> Result<Self> {
        Self::connect_with_timeout(config, REQUEST_TIMEOUT).await
    }

    /// Like [`Self::connect`] with a custom per-request deadline
    ///
    /// # Errors
    ///
    /// Returns error if the server cannot be started or reached, or the
    /// handshake fails
    pub async fn connect_with_timeout(config: ToolServerConfig, timeout: Duration) -> Result<Self> {
        let connected = Arc::new(AtomicBool::new(false));
        let transport = match config.transport {
            TransportKind::Stdio => Transport::Stdio(StdioTransport::spawn(
                &config,
                Arc::clone(&connected),
                timeout,
            )?),
            TransportKind::Http => {
                let url = config
                    .url
                    .clone()
                    .filter(|u| !u.trim().is_empty())
                    .ok_or_else(|| {
                        Error::Tool(format!(
                            "MCP server \"{}\": no URL specified for HTTP transport",
                            config.name
                        ))
                    })?;
                Transport::Http(HttpTransport {
                    client: reqwest::Client::new(),
                    url,
                    next_id: AtomicU64::new(0),
                    timeout,
                })
            }
        };

        let mut client = Self {
            config,
            transport,
            connected,
            tools: Vec::new(),
        };

        if let Err(e) = client.handshake().await {
            client.disconnect().await;
            return Err(Error::Tool(format!(
                "MCP server \"{}\" connection failed: {e}",
                client.config.name
            )));
        }
        Ok(client)
    }

    async fn handshake(&mut self) -> Result<()> {
        self.request(
            "initialize",
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": "v2note-gateway",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
        )
        .await?;

        if let Transport::Stdio(stdio) = &self.transport {
            stdio.notify("notifications/initialized", json!({})).await?;
        }
        self.connected.store(true, Ordering::SeqCst);

        self.tools = self.list_tools().await?;
        tracing::info!(
            server = %self.config.name,
            tools = self.tools.len(),
            "connected to tool server"
        );
        Ok(())
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        match &self.transport {
            Transport::Stdio(stdio) => stdio.request(method, params).await,
            Transport::Http(http) => http.request(method, params).await,
        }
    }

    /// Ask the server for its current tools
    ///
    /// # Errors
    ///
    /// Returns error if the request fails or the result is malformed
    pub async fn list_tools(&self) -> Result<Vec<ToolInfo>> {
        #[derive(Deserialize)]
        struct ListResult {
            #[serde(default)]
            tools: Vec<ToolInfo>,
        }

        let result = self.request("tools/list", json!({})).await?;
        if result.is_null() {
            return Ok(Vec::new());
        }
        let list: ListResult = serde_json::from_value(result)?;
        Ok(list.tools)
    }

    /// Invoke a tool by its server-local name
    ///
    /// # Errors
    ///
    /// Returns error if the request fails, times out, or the result is malformed
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCallOutput> {
        let result = self
            .request("tools/call", json!({ "name": name, "arguments": arguments }))
            .await?;
        if result.is_null() {
            return Ok(ToolCallOutput::default());
        }
        Ok(serde_json::from_value(result)?)
    }

    /// Tear down the connection, killing a local process
    pub async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Transport::Stdio(stdio) = &self.transport {
            stdio.shutdown().await;
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    #[must_use]
    pub const fn config(&self) -> &ToolServerConfig {
        &self.config
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Tools discovered at connect time
    #[must_use]
    pub fn tools(&self) -> &[ToolInfo] {
        &self.tools
    }
}
