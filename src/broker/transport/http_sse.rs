//! HTTP/SSE transport: per-call tool execution against a downstream MCP
//! server reached over HTTP. Discovery for the same server happens over
//! plain JSON-RPC (`http_jsonrpc`); execution is rewritten onto a dedicated
//! SSE endpoint so results can stream back chunk by chunk.

use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use std::pin::Pin;

use crate::broker::error::BrokerError;

/// Rewrite a configured discovery endpoint (ending in `/mcp`) onto the
/// execution endpoint the same server exposes for streamed tool calls.
/// Servers that don't follow the `/mcp` convention are called unchanged.
pub fn execution_endpoint(server_url: &str) -> String {
    if let Some(base) = server_url.strip_suffix("/mcp") {
        format!("{base}/sse/openai/tool/call")
    } else {
        server_url.to_string()
    }
}

pub async fn call_stream(
    client: &reqwest::Client,
    server_url: &str,
    tool_name: &str,
    arguments: Value,
) -> Result<Pin<Box<dyn Stream<Item = Result<String, BrokerError>> + Send>>, BrokerError> {
    let endpoint = execution_endpoint(server_url);
    let body = json!({ "tool_name": tool_name, "arguments": arguments });

    let response = client
        .post(&endpoint)
        .header("Accept", "text/event-stream")
        .json(&body)
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(BrokerError::Transport(format!(
            "tool call against {endpoint} returned {}",
            response.status()
        )));
    }

    let is_event_stream = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("text/event-stream"))
        .unwrap_or(false);
    if !is_event_stream {
        return Err(BrokerError::Protocol(format!(
            "{endpoint} did not respond with text/event-stream"
        )));
    }

    let byte_stream = response.bytes_stream().map(|r| r.map_err(std::io::Error::other));
    let mut events = byte_stream.eventsource();

    let stream = async_stream::stream! {
        while let Some(event) = events.next().await {
            let event = match event {
                Ok(e) => e,
                Err(e) => {
                    yield Err(BrokerError::Transport(format!("sse decode error: {e}")));
                    return;
                }
            };

            match event.event.as_str() {
                "" | "data" | "message" => {}
                "end" => return,
                "error" => {
                    yield Err(BrokerError::Protocol(event.data));
                    return;
                }
                _ => continue,
            }

            let data = event.data.trim();
            if data.is_empty() || data == "[DONE]" {
                continue;
            }

            match serde_json::from_str::<Value>(data) {
                Ok(value) => {
                    if matches!(
                        value.get("type").and_then(|t| t.as_str()),
                        Some("structure_start") | Some("structure_complete")
                    ) {
                        continue;
                    }
                    if let Some(chunk) = extract_chunk(&value) {
                        if !chunk.is_empty() {
                            yield Ok(chunk);
                        }
                    }
                }
                Err(_) => yield Ok(data.to_string()),
            }
        }
        log::debug!("sse stream for {endpoint} ended without a terminating 'end' event");
    };

    Ok(Box::pin(stream))
}

/// Priority chain for pulling a text chunk out of one SSE event payload.
/// Downstream servers emit several shapes for the same idea; tried in order
/// of how directly they name "this is the text to show".
fn extract_chunk(value: &Value) -> Option<String> {
    if let Some(s) = value.get("chunk").and_then(|v| v.as_str()) {
        return Some(s.to_string());
    }
    if let Some(s) = value.get("display").and_then(|v| v.as_str()) {
        return Some(format!("{s}\n"));
    }
    if let Some(s) = value.get("content").and_then(|v| v.as_str()) {
        return Some(s.to_string());
    }
    if let Some(nested) = value.get("data") {
        if let Some(chunk) = extract_chunk(nested) {
            return Some(chunk);
        }
    }
    if let Some(delta) = value.pointer("/choices/0/delta") {
        if let Some(s) = delta.get("content").and_then(|v| v.as_str()) {
            return Some(s.to_string());
        }
        if let Some(s) = delta
            .pointer("/function_call/arguments")
            .and_then(|v| v.as_str())
        {
            return Some(s.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_mcp_suffix_to_sse_tool_call() {
        assert_eq!(
            execution_endpoint("https://example.com/api/mcp"),
            "https://example.com/api/sse/openai/tool/call"
        );
    }

    #[test]
    fn leaves_unrecognized_endpoints_unchanged() {
        assert_eq!(
            execution_endpoint("https://example.com/api/rpc"),
            "https://example.com/api/rpc"
        );
    }

    #[test]
    fn chunk_extraction_priority_chain() {
        assert_eq!(
            extract_chunk(&json!({"chunk": "a", "content": "b"})).unwrap(),
            "a"
        );
        assert_eq!(
            extract_chunk(&json!({"display": "line"})).unwrap(),
            "line\n"
        );
        assert_eq!(
            extract_chunk(&json!({"content": "c"})).unwrap(),
            "c"
        );
        assert_eq!(
            extract_chunk(&json!({"data": {"chunk": "nested"}})).unwrap(),
            "nested"
        );
        assert_eq!(
            extract_chunk(&json!({"choices": [{"delta": {"content": "oa"}}]})).unwrap(),
            "oa"
        );
        assert!(extract_chunk(&json!({"type": "structure_start"})).is_none());
    }
}
