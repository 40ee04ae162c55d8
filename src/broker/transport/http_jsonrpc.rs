//! HTTP/JSON-RPC transport: used only for tool discovery (`tools/list`)
//! against an HTTP-reachable downstream MCP server. Per-call execution for
//! the same server goes over SSE instead (`http_sse`).

use serde_json::{json, Value};

use crate::broker::error::BrokerError;
use crate::broker::transport::stdio::DiscoveredTool;

pub async fn list_tools(
    client: &reqwest::Client,
    server_url: &str,
    role: Option<&str>,
) -> Result<Vec<DiscoveredTool>, BrokerError> {
    let params = match role {
        Some(r) => json!({ "role": r }),
        None => json!({}),
    };
    let body = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "tools/list",
        "params": params,
    });

    let response = client.post(server_url).json(&body).send().await?;
    if !response.status().is_success() {
        return Err(BrokerError::Transport(format!(
            "tools/list against {server_url} returned {}",
            response.status()
        )));
    }

    let value: Value = response.json().await?;
    if let Some(error) = value.get("error") {
        return Err(BrokerError::Protocol(error.to_string()));
    }

    let tools = value
        .pointer("/result/tools")
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_input_schema_or_parameters_alias() {
        let raw = json!({
            "result": {
                "tools": [
                    {"name": "a", "description": "da", "inputSchema": {"type": "object"}},
                    {"name": "b", "description": "db", "parameters": {"type": "object"}},
                ]
            }
        });
        let tools = raw
            .pointer("/result/tools")
            .and_then(|t| t.as_array())
            .cloned()
            .unwrap();
        assert_eq!(tools.len(), 2);
    }
}
