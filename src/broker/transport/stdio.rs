//! Stdio transport: a spawned subprocess MCP server, addressed with
//! newline-delimited JSON-RPC-ish requests/responses over stdin/stdout.
//!
//! The exact request/response framing used on the wire is the external MCP
//! framework's concern (§6); this implementation picks one concrete,
//! reasonable framing (one JSON object per line) so the broker has
//! something it can actually drive, and isolates it behind `StdioClient` so
//! a real framework-provided client could be swapped in without touching
//! the broker.

use futures::Stream;
use serde_json::{json, Value};
use std::pin::Pin;
use std::process::Stdio as ProcStdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::Mutex;

use crate::broker::error::BrokerError;
use crate::broker::stdio_cache::StdioKey;

pub struct DiscoveredTool {
    pub name: String,
    pub description: String,
    pub schema: Value,
}

/// A long-lived subprocess MCP client. `stdin`/`stdout` are serialized
/// behind a mutex: stdio MCP servers process one request at a time, and the
/// spec requires at most one in-flight call per cached client anyway (the
/// broker dispatches tool calls of one assistant message sequentially).
pub struct StdioClient {
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    stdout: Mutex<BufReader<ChildStdout>>,
}

impl std::fmt::Debug for StdioClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioClient").finish_non_exhaustive()
    }
}

impl StdioClient {
    pub async fn spawn(key: &StdioKey) -> Result<Self, BrokerError> {
        let mut parts = key.command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| BrokerError::Transport(format!("empty command for {:?}", key)))?;

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(parts)
            .stdin(ProcStdio::piped())
            .stdout(ProcStdio::piped())
            .stderr(ProcStdio::null());

        if let Some(dir) = &key.config_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| BrokerError::Transport(format!("spawn '{}' failed: {e}", key.command)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BrokerError::Transport("child has no stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BrokerError::Transport("child has no stdout".into()))?;

        Ok(Self {
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            stdout: Mutex::new(BufReader::new(stdout)),
        })
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, BrokerError> {
        let request = json!({"jsonrpc": "2.0", "id": 1, "method": method, "params": params});
        let mut line = serde_json::to_string(&request)?;
        line.push('\n');

        {
            let mut stdin = self.stdin.lock().await;
            stdin
                .write_all(line.as_bytes())
                .await
                .map_err(BrokerError::Io)?;
            stdin.flush().await.map_err(BrokerError::Io)?;
        }

        let mut response_line = String::new();
        {
            let mut stdout = self.stdout.lock().await;
            let n = stdout
                .read_line(&mut response_line)
                .await
                .map_err(BrokerError::Io)?;
            if n == 0 {
                log::warn!("stdio server closed stdout before responding to '{method}'");
                return Err(BrokerError::Transport(
                    "stdio server closed stdout".into(),
                ));
            }
        }

        let value: Value = serde_json::from_str(response_line.trim())?;
        if let Some(error) = value.get("error") {
            return Err(BrokerError::Protocol(error.to_string()));
        }
        Ok(value.get("result").cloned().unwrap_or(Value::Null))
    }

    pub async fn tools_list(&self) -> Result<Vec<DiscoveredTool>, BrokerError> {
        let result = self.request("tools/list", json!({})).await?;
        let tools = result
            .get("tools")
            .and_then(|t| t.as_array())
            .cloned()
            .unwrap_or_default();

        Ok(tools
            .into_iter()
            .filter_map(|t| {
                let name = t.get("name")?.as_str()?.to_string();
                let description = t
                    .get("description")
                    .and_then(|d| d.as_str())
                    .unwrap_or_default()
                    .to_string();
                let schema = t
                    .get("inputSchema")
                    .or_else(|| t.get("parameters"))
                    .cloned()
                    .unwrap_or_else(|| json!({}));
                Some(DiscoveredTool {
                    name,
                    description,
                    schema,
                })
            })
            .collect())
    }

    pub async fn tool_info(&self, name: &str) -> Result<Option<DiscoveredTool>, BrokerError> {
        let tools = self.tools_list().await?;
        Ok(tools.into_iter().find(|t| t.name == name))
    }

    /// Streaming call: the child emits one JSON object per line, either
    /// `{"chunk": "..."}`, `{"error": "..."}`, or `{"done": true}`. Yields
    /// every chunk in order; an `error` line surfaces as `Err` and ends the
    /// stream; a `done` line (or EOF) ends it cleanly.
    pub async fn call_stream(
        &self,
        tool_name: &str,
        arguments: Value,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<String, BrokerError>> + Send + '_>>, BrokerError>
    {
        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "call",
            "params": {"name": tool_name, "arguments": arguments},
        });
        let mut line = serde_json::to_string(&request)?;
        line.push('\n');

        {
            let mut stdin = self.stdin.lock().await;
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await?;
        }

        let stream = async_stream::stream! {
            let mut stdout = self.stdout.lock().await;
            loop {
                let mut response_line = String::new();
                let n = match stdout.read_line(&mut response_line).await {
                    Ok(n) => n,
                    Err(e) => {
                        yield Err(BrokerError::Io(e));
                        return;
                    }
                };
                if n == 0 {
                    log::debug!("stdio server for '{tool_name}' closed stdout without a done/error marker");
                    return;
                }
                let trimmed = response_line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let value: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(_) => {
                        yield Ok(trimmed.to_string());
                        continue;
                    }
                };
                if value.get("done").and_then(|d| d.as_bool()).unwrap_or(false) {
                    return;
                }
                if let Some(error) = value.get("error") {
                    yield Err(BrokerError::Protocol(error.to_string()));
                    return;
                }
                if let Some(chunk) = value.get("chunk") {
                    let text = super::normalize_chunk(chunk);
                    if !text.is_empty() {
                        yield Ok(text);
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }

    pub async fn shutdown(&self) -> Result<(), BrokerError> {
        let mut child = self.child.lock().await;
        child.start_kill().map_err(BrokerError::Io)?;
        let _ = child.wait().await;
        Ok(())
    }
}
