//! Flat runtime configuration.
//!
//! The original framework registers configuration via decorators scattered
//! across the host process; here it collapses to one plain struct built
//! once at startup and handed to the driver, broker, history store, and
//! scheduler by value or `Arc`. No hot-reload, no registration.

use std::collections::HashMap;
use std::time::Duration;

/// One HTTP-reachable downstream MCP server (`mcp_servers` entries).
#[derive(Debug, Clone)]
pub struct HttpServerConfig {
    pub name: String,
    pub url: String,
}

/// One stdio-spawned downstream MCP server (`stdio_mcp_servers` entries).
#[derive(Debug, Clone)]
pub struct StdioServerConfig {
    pub name: String,
    pub command: String,
    pub alias: String,
    pub config_dir: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// LLM chat-completion endpoint.
    pub api_key: String,
    pub base_url: String,
    pub model_name: String,

    /// Initial system message, if any.
    pub system_prompt: Option<String>,

    /// Downstream MCP servers reachable over HTTP (JSON-RPC discovery, SSE
    /// execution), parsed from `name1:url1,name2:url2`.
    pub mcp_servers: Vec<HttpServerConfig>,

    /// Downstream MCP servers reached via a spawned subprocess, parsed from
    /// `name:command--alias[,...]`.
    pub stdio_mcp_servers: Vec<StdioServerConfig>,

    /// Rounds between forced summaries.
    pub summary_interval: usize,

    /// Hard upper bound on driver recursion.
    pub max_rounds: usize,

    /// Transcript byte-size that forces a summary regardless of round count.
    pub summary_length_threshold: usize,

    /// Summarizer sub-conversation prompts.
    pub summary_instruction: String,
    pub summary_request: String,

    /// Chat history store.
    pub enable_history: bool,
    pub history_backend_uri: Option<String>,
    pub history_limit: usize,

    /// Optional role tag sent to downstream servers on tool discovery, used
    /// to filter which tools a server advertises.
    pub role: Option<String>,

    /// Connect/total timeouts for the LLM and SSE tool-call HTTP clients.
    pub connect_timeout: Duration,
    pub request_timeout: Duration,

    /// Timeout for a single history-backend probe attempt.
    pub history_probe_timeout: Duration,

    /// Provider-specific overrides, kept flat rather than re-introducing a
    /// decorator/registration layer.
    pub extra: HashMap<String, String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openai.com/v1".to_string(),
            model_name: "gpt-4o-mini".to_string(),
            system_prompt: None,
            mcp_servers: Vec::new(),
            stdio_mcp_servers: Vec::new(),
            summary_interval: 5,
            max_rounds: 25,
            summary_length_threshold: 30_000,
            summary_instruction: "Summarize the conversation so far, preserving any facts, \
                decisions, and open tasks the assistant will need to continue the work."
                .to_string(),
            summary_request: "Please summarize our conversation so far.".to_string(),
            enable_history: false,
            history_backend_uri: None,
            history_limit: 100,
            role: None,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(120),
            history_probe_timeout: Duration::from_millis(2_000),
            extra: HashMap::new(),
        }
    }
}

impl RuntimeConfig {
    /// Parse `mcp_servers`'s wire format: `name1:url1,name2:url2`.
    pub fn parse_http_servers(spec: &str) -> Vec<HttpServerConfig> {
        spec.split(',')
            .filter_map(|entry| {
                let entry = entry.trim();
                if entry.is_empty() {
                    return None;
                }
                let (name, url) = entry.split_once(':')?;
                Some(HttpServerConfig {
                    name: name.trim().to_string(),
                    url: url.trim().to_string(),
                })
            })
            .collect()
    }

    /// Parse `stdio_mcp_servers`'s wire format: `name:command--alias[,...]`.
    pub fn parse_stdio_servers(spec: &str) -> Vec<StdioServerConfig> {
        spec.split(',')
            .filter_map(|entry| {
                let entry = entry.trim();
                if entry.is_empty() {
                    return None;
                }
                let (name, rest) = entry.split_once(':')?;
                let (command, alias) = rest.split_once("--").unwrap_or((rest, name));
                Some(StdioServerConfig {
                    name: name.trim().to_string(),
                    command: command.trim().to_string(),
                    alias: alias.trim().to_string(),
                    config_dir: None,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.summary_interval, 5);
        assert_eq!(cfg.max_rounds, 25);
        assert_eq!(cfg.summary_length_threshold, 30_000);
    }

    #[test]
    fn parses_http_servers() {
        let servers = RuntimeConfig::parse_http_servers("alpha:http://a,beta:http://b");
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].name, "alpha");
        assert_eq!(servers[1].url, "http://b");
    }

    #[test]
    fn parses_stdio_servers_with_alias() {
        let servers = RuntimeConfig::parse_stdio_servers("fs:node server.js--filesystem");
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].command, "node server.js");
        assert_eq!(servers[0].alias, "filesystem");
    }

    #[test]
    fn stdio_server_without_alias_uses_name() {
        let servers = RuntimeConfig::parse_stdio_servers("fs:node server.js");
        assert_eq!(servers[0].alias, "fs");
    }
}
