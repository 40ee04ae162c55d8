//! Tool broker: a catalog of downstream MCP tools reachable over HTTP/SSE
//! or stdio, and streaming per-call execution against whichever transport a
//! call's descriptor names.

pub mod error;
pub mod stdio_cache;
pub mod transport;

use dashmap::DashMap;
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub use error::BrokerError;
use stdio_cache::{StdioClientCache, StdioKey};
use transport::{http_jsonrpc, http_sse, normalize_arguments};

use crate::config::RuntimeConfig;
use crate::llm::{Tool, ToolCall};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Sse,
    Stdio,
}

#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub prefixed_name: String,
    pub description: String,
    pub parameter_schema: Value,
    pub protocol: Protocol,
    pub server_prefix: String,
    pub original_name: String,
    /// HTTP server endpoint, populated when `protocol == Sse`.
    pub endpoint: Option<String>,
    /// Stdio client identity, populated when `protocol == Stdio`.
    pub stdio_key: Option<StdioKey>,
}

impl ToolDescriptor {
    pub fn as_tool(&self) -> Tool {
        Tool {
            name: self.prefixed_name.clone(),
            description: self.description.clone(),
            parameters: self.parameter_schema.clone(),
        }
    }
}

/// One event in a tool call's execution stream. `is_final` events carry the
/// full accumulated text for that call (including any trailing error
/// payload); non-final events carry only the incremental chunk.
#[derive(Debug, Clone)]
pub struct ToolExecutionEvent {
    pub call_id: String,
    pub tool_name: String,
    pub text: String,
    pub is_final: bool,
    pub is_error: bool,
}

pub struct ToolBroker {
    http_client: reqwest::Client,
    http_servers: Vec<crate::config::HttpServerConfig>,
    stdio_servers: Vec<crate::config::StdioServerConfig>,
    role: Option<String>,
    catalog: DashMap<String, ToolDescriptor>,
    stdio_cache: StdioClientCache,
    lazy: AtomicBool,
}

impl ToolBroker {
    pub fn new(config: &RuntimeConfig) -> Result<Self, BrokerError> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            http_client,
            http_servers: config.mcp_servers.clone(),
            stdio_servers: config.stdio_mcp_servers.clone(),
            role: config.role.clone(),
            catalog: DashMap::new(),
            stdio_cache: StdioClientCache::new(),
            lazy: AtomicBool::new(true),
        })
    }

    /// Discover every configured server's tools up front (`eager = true`)
    /// or leave the catalog empty for lazy per-call resolution.
    pub async fn init(&self, eager: bool) -> Result<(), BrokerError> {
        self.lazy.store(!eager, Ordering::SeqCst);
        if !eager {
            return Ok(());
        }

        for server in self.http_servers.clone() {
            let tools =
                http_jsonrpc::list_tools(&self.http_client, &server.url, self.role.as_deref())
                    .await?;
            for tool in tools {
                self.insert_descriptor(ToolDescriptor {
                    prefixed_name: format!("{}_{}", server.name, tool.name),
                    description: tool.description,
                    parameter_schema: tool.schema,
                    protocol: Protocol::Sse,
                    server_prefix: server.name.clone(),
                    original_name: tool.name,
                    endpoint: Some(server.url.clone()),
                    stdio_key: None,
                });
            }
        }

        for server in self.stdio_servers.clone() {
            let key = StdioKey {
                command: server.command.clone(),
                alias: server.alias.clone(),
                config_dir: server.config_dir.clone(),
            };
            let client = self.stdio_cache.get_or_create(key.clone()).await?;
            let tools = client.tools_list().await?;
            for tool in tools {
                self.insert_descriptor(ToolDescriptor {
                    prefixed_name: format!("{}_{}", server.name, tool.name),
                    description: tool.description,
                    parameter_schema: tool.schema,
                    protocol: Protocol::Stdio,
                    server_prefix: server.name.clone(),
                    original_name: tool.name,
                    endpoint: None,
                    stdio_key: Some(key.clone()),
                });
            }
        }

        Ok(())
    }

    fn insert_descriptor(&self, descriptor: ToolDescriptor) {
        self.catalog
            .entry(descriptor.prefixed_name.clone())
            .or_insert(descriptor);
    }

    pub fn catalog(&self) -> Vec<ToolDescriptor> {
        self.catalog.iter().map(|e| e.value().clone()).collect()
    }

    /// Resolve `prefixed_name` to a descriptor, discovering it from its
    /// downstream server on a cold miss when lazy resolution is enabled.
    async fn resolve(&self, prefixed_name: &str) -> Result<ToolDescriptor, BrokerError> {
        if let Some(existing) = self.catalog.get(prefixed_name) {
            return Ok(existing.clone());
        }
        if !self.lazy.load(Ordering::SeqCst) {
            return Err(BrokerError::UnknownServer(prefixed_name.to_string()));
        }

        let (prefix, rest) = prefixed_name
            .split_once('_')
            .ok_or_else(|| BrokerError::UnknownServer(prefixed_name.to_string()))?;

        if let Some(server) = self.http_servers.iter().find(|s| s.name == prefix) {
            let tools =
                http_jsonrpc::list_tools(&self.http_client, &server.url, self.role.as_deref())
                    .await?;
            let tool = tools
                .into_iter()
                .find(|t| t.name == rest)
                .ok_or_else(|| {
                    BrokerError::ToolNotAdvertised(server.name.clone(), rest.to_string())
                })?;
            let descriptor = ToolDescriptor {
                prefixed_name: prefixed_name.to_string(),
                description: tool.description,
                parameter_schema: tool.schema,
                protocol: Protocol::Sse,
                server_prefix: server.name.clone(),
                original_name: tool.name,
                endpoint: Some(server.url.clone()),
                stdio_key: None,
            };
            self.insert_descriptor(descriptor.clone());
            return Ok(descriptor);
        }

        if let Some(server) = self.stdio_servers.iter().find(|s| s.name == prefix) {
            let key = StdioKey {
                command: server.command.clone(),
                alias: server.alias.clone(),
                config_dir: server.config_dir.clone(),
            };
            let client = self.stdio_cache.get_or_create(key.clone()).await?;
            let tool = client.tool_info(rest).await?.ok_or_else(|| {
                BrokerError::ToolNotAdvertised(server.name.clone(), rest.to_string())
            })?;
            let descriptor = ToolDescriptor {
                prefixed_name: prefixed_name.to_string(),
                description: tool.description,
                parameter_schema: tool.schema,
                protocol: Protocol::Stdio,
                server_prefix: server.name.clone(),
                original_name: tool.name,
                endpoint: None,
                stdio_key: Some(key),
            };
            self.insert_descriptor(descriptor.clone());
            return Ok(descriptor);
        }

        Err(BrokerError::UnknownServer(prefix.to_string()))
    }

    /// Stream execution events for every call in `tool_calls`, in order.
    /// Calls are dispatched one at a time: stdio servers process one
    /// request at a time anyway, and this keeps delivery order stable for
    /// the driver's transcript reconstruction.
    pub fn execute<'a>(
        &'a self,
        tool_calls: &'a [ToolCall],
    ) -> impl Stream<Item = ToolExecutionEvent> + 'a {
        async_stream::stream! {
            for call in tool_calls {
                let arguments = normalize_arguments(&call.arguments);
                match self.execute_one(call, arguments).await {
                    Ok(mut inner) => {
                        let mut accumulated = String::new();
                        let mut saw_error = false;
                        while let Some(item) = inner.next().await {
                            match item {
                                Ok(text) => {
                                    accumulated.push_str(&text);
                                    yield ToolExecutionEvent {
                                        call_id: call.id.clone(),
                                        tool_name: call.function_name.clone(),
                                        text,
                                        is_final: false,
                                        is_error: false,
                                    };
                                }
                                Err(err) => {
                                    accumulated.push_str(&err.to_string());
                                    saw_error = true;
                                    break;
                                }
                            }
                        }
                        yield ToolExecutionEvent {
                            call_id: call.id.clone(),
                            tool_name: call.function_name.clone(),
                            text: accumulated,
                            is_final: true,
                            is_error: saw_error,
                        };
                    }
                    Err(err) => {
                        yield ToolExecutionEvent {
                            call_id: call.id.clone(),
                            tool_name: call.function_name.clone(),
                            text: err.to_string(),
                            is_final: true,
                            is_error: true,
                        };
                    }
                }
            }
        }
    }

    async fn execute_one(
        &self,
        call: &ToolCall,
        arguments: Value,
    ) -> Result<
        std::pin::Pin<Box<dyn Stream<Item = Result<String, BrokerError>> + Send + '_>>,
        BrokerError,
    > {
        let descriptor = self.resolve(&call.function_name).await?;
        match descriptor.protocol {
            Protocol::Sse => {
                let endpoint = descriptor
                    .endpoint
                    .ok_or_else(|| BrokerError::UnknownServer(descriptor.prefixed_name.clone()))?;
                let stream = http_sse::call_stream(
                    &self.http_client,
                    &endpoint,
                    &descriptor.original_name,
                    arguments,
                )
                .await?;
                Ok(stream)
            }
            Protocol::Stdio => {
                let key = descriptor
                    .stdio_key
                    .ok_or_else(|| BrokerError::UnknownServer(descriptor.prefixed_name.clone()))?;
                let client = self.stdio_cache.get_or_create(key.clone()).await?;
                let original_name = descriptor.original_name.clone();
                let stream = async_stream::stream! {
                    match client.call_stream(&original_name, arguments).await {
                        Ok(mut inner) => {
                            let mut saw_error = false;
                            while let Some(item) = inner.next().await {
                                saw_error |= item.is_err();
                                yield item;
                            }
                            if saw_error {
                                self.stdio_cache.remove(&key).await;
                            }
                        }
                        Err(e) => {
                            self.stdio_cache.remove(&key).await;
                            yield Err(e);
                        }
                    }
                };
                Ok(Box::pin(stream))
            }
        }
    }

    pub async fn close(&self) {
        self.stdio_cache.close_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixed_name_round_trips_through_split() {
        let prefixed = "fs_read_file";
        let (prefix, rest) = prefixed.split_once('_').unwrap();
        assert_eq!(prefix, "fs");
        assert_eq!(rest, "read_file");
    }

    #[tokio::test]
    async fn unknown_prefix_with_lazy_disabled_errors() {
        let config = RuntimeConfig::default();
        let broker = ToolBroker::new(&config).unwrap();
        broker.lazy.store(false, Ordering::SeqCst);
        let err = broker.resolve("ghost_tool").await.unwrap_err();
        assert!(matches!(err, BrokerError::UnknownServer(_)));
    }

    #[tokio::test]
    async fn unconfigured_prefix_errors_even_when_lazy() {
        let config = RuntimeConfig::default();
        let broker = ToolBroker::new(&config).unwrap();
        let err = broker.resolve("ghost_tool").await.unwrap_err();
        assert!(matches!(err, BrokerError::UnknownServer(_)));
    }
}
