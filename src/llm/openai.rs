// Streaming chat-completion client for an OpenAI-compatible endpoint,
// following OpenAI's SSE chunk framing (reqwest + eventsource-stream).

use crate::llm::provider::*;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Chat-completion client for any OpenAI-compatible `/chat/completions`
/// endpoint. `base_url` and `model` come straight from `RuntimeConfig`
/// (§6 `base_url`, `model_name`) so this one implementation covers every
/// vendor the host points it at.
#[derive(Clone)]
pub struct OpenAiCompatibleClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    config: Arc<RwLock<ProviderConfig>>,
    state: Arc<RwLock<ProviderState>>,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    max_tokens: u32,
    stream: bool,
    stream_options: StreamOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAiTool>>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize, Clone)]
struct OpenAiTool {
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: OpenAiFunction,
}

#[derive(Debug, Serialize, Clone)]
struct OpenAiFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Serialize, Clone)]
#[serde(tag = "role")]
enum ChatMessage {
    #[serde(rename = "system")]
    System { content: String },
    #[serde(rename = "user")]
    User { content: String },
    #[serde(rename = "assistant")]
    Assistant {
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<OpenAiToolCall>>,
    },
    #[serde(rename = "tool")]
    Tool {
        content: String,
        tool_call_id: String,
    },
}

#[derive(Debug, Serialize, Clone)]
struct OpenAiToolCall {
    id: String,
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: OpenAiFunctionCall,
}

#[derive(Debug, Serialize, Clone)]
struct OpenAiFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    delta: Delta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Default, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

impl OpenAiCompatibleClient {
    pub fn new(api_key: String, base_url: String, model: String) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(ProviderError::NetworkError)?;

        Ok(Self {
            client,
            api_key,
            base_url,
            model,
            config: Arc::new(RwLock::new(ProviderConfig::default())),
            state: Arc::new(RwLock::new(ProviderState::default())),
        })
    }

    fn convert_message(msg: &Message) -> ChatMessage {
        match msg.role {
            Role::System => ChatMessage::System {
                content: msg.content.clone(),
            },
            Role::User => ChatMessage::User {
                content: msg.content.clone(),
            },
            Role::Assistant => ChatMessage::Assistant {
                content: if msg.content.is_empty() {
                    None
                } else {
                    Some(msg.content.clone())
                },
                tool_calls: msg.tool_calls.as_ref().map(|calls| {
                    calls
                        .iter()
                        .map(|tc| OpenAiToolCall {
                            id: tc.id.clone(),
                            tool_type: "function",
                            function: OpenAiFunctionCall {
                                name: tc.function_name.clone(),
                                arguments: tc.arguments.clone(),
                            },
                        })
                        .collect()
                }),
            },
            Role::Tool => ChatMessage::Tool {
                content: msg.content.clone(),
                tool_call_id: msg.tool_call_id.clone().unwrap_or_default(),
            },
        }
    }

    fn convert_tools(tools: &[Tool]) -> Vec<OpenAiTool> {
        tools
            .iter()
            .map(|t| OpenAiTool {
                tool_type: "function",
                function: OpenAiFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                },
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl ChatCompletionClient for OpenAiCompatibleClient {
    fn config(&self) -> ProviderConfig {
        self.config.read().map(|c| c.clone()).unwrap_or_default()
    }

    fn set_config(&self, cfg: ProviderConfig) {
        if let Ok(mut c) = self.config.write() {
            *c = cfg;
        }
    }

    fn state(&self) -> ProviderState {
        self.state.read().map(|s| s.clone()).unwrap_or_default()
    }

    async fn stream_turn(
        &self,
        messages: Vec<Message>,
        tools: Vec<Tool>,
    ) -> Result<Pin<Box<dyn futures::Stream<Item = Result<StreamChunk, ProviderError>> + Send>>, ProviderError> {
        let cfg = self.config();
        let chat_messages: Vec<ChatMessage> = messages.iter().map(Self::convert_message).collect();
        let openai_tools = if tools.is_empty() {
            None
        } else {
            Some(Self::convert_tools(&tools))
        };

        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages: chat_messages,
            // Some models reject custom temperature once tools are attached.
            temperature: if openai_tools.is_some() {
                None
            } else {
                Some(cfg.temperature)
            },
            max_tokens: cfg.max_tokens,
            stream: true,
            stream_options: StreamOptions { include_usage: true },
            tools: openai_tools,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| ProviderError::ApiError(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_else(|_| "unknown error".to_string());
            return Err(ProviderError::ApiError(format!("HTTP {}: {}", status, error_text)));
        }

        let event_stream = response.bytes_stream().eventsource();
        let state = self.state.clone();

        let output_stream = async_stream::stream! {
            futures::pin_mut!(event_stream);

            // Maps OpenAI's per-chunk array index to the id assigned on the
            // first delta for that index; only the first delta for an index
            // carries an id.
            let mut index_to_id: HashMap<usize, String> = HashMap::new();
            let mut finish_reason: Option<FinishReason> = None;
            let mut done_emitted = false;

            while let Some(event_result) = event_stream.next().await {
                let event = match event_result {
                    Ok(event) => event,
                    Err(e) => {
                        yield Err(ProviderError::ApiError(format!("stream error: {e}")));
                        return;
                    }
                };

                if event.data == "[DONE]" {
                    break;
                }

                let chunk: ChatCompletionChunk = match serde_json::from_str(&event.data) {
                    Ok(c) => c,
                    Err(e) => {
                        yield Err(ProviderError::ApiError(format!("failed to parse chunk: {e}")));
                        return;
                    }
                };

                if chunk.choices.is_empty() {
                    if let Some(usage) = chunk.usage {
                        let token_usage = TokenUsage {
                            input_tokens: usage.prompt_tokens,
                            output_tokens: usage.completion_tokens,
                            cached_tokens: 0,
                        };
                        if let Ok(mut s) = state.write() {
                            s.input_tokens += token_usage.input_tokens as u64;
                            s.output_tokens += token_usage.output_tokens as u64;
                            s.request_count += 1;
                            s.last_request_time = Some(std::time::SystemTime::now());
                        }
                        yield Ok(StreamChunk::Done {
                            finish_reason: finish_reason.clone().unwrap_or(FinishReason::Stop),
                            usage: token_usage,
                        });
                        done_emitted = true;
                    }
                    continue;
                }

                for choice in chunk.choices {
                    if let Some(content) = choice.delta.content {
                        if !content.is_empty() {
                            yield Ok(StreamChunk::Content(content));
                        }
                    }

                    if let Some(deltas) = choice.delta.tool_calls {
                        for delta in deltas {
                            if let Some(id) = &delta.id {
                                index_to_id.insert(delta.index, id.clone());
                            }
                            let Some(id) = index_to_id.get(&delta.index).cloned() else {
                                continue;
                            };
                            yield Ok(StreamChunk::ToolCallDelta {
                                id,
                                name: delta.function.as_ref().and_then(|f| f.name.clone()),
                                arguments_delta: delta.function.as_ref().and_then(|f| f.arguments.clone()),
                            });
                        }
                    }

                    if let Some(reason) = choice.finish_reason {
                        // Recorded, not yielded yet: OpenAI sends the
                        // usage-bearing chunk in a following SSE event, and
                        // the turn must end with exactly one Done.
                        finish_reason = Some(match reason.as_str() {
                            "stop" => FinishReason::Stop,
                            "length" => FinishReason::Length,
                            "tool_calls" => FinishReason::ToolCalls,
                            "content_filter" => FinishReason::ContentFilter,
                            other => FinishReason::Other(other.to_string()),
                        });
                    }
                }
            }

            if !done_emitted {
                // Server closed the stream without a trailing usage chunk
                // (some OpenAI-compatible servers omit it); still terminate
                // the turn with whatever finish reason we observed.
                yield Ok(StreamChunk::Done {
                    finish_reason: finish_reason.unwrap_or(FinishReason::Stop),
                    usage: TokenUsage::default(),
                });
            }
        };

        Ok(Box::pin(output_stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_construction_sets_timeouts() {
        let client = OpenAiCompatibleClient::new(
            "key".into(),
            "https://api.openai.com/v1".into(),
            "gpt-4o-mini".into(),
        );
        assert!(client.is_ok());
    }

    #[test]
    fn convert_tool_call_round_trips_through_wire_shape() {
        let msg = Message::assistant(
            "",
            vec![ToolCall {
                id: "call_1".into(),
                function_name: "search".into(),
                arguments: "{\"q\":\"rust\"}".into(),
            }],
        );
        let converted = OpenAiCompatibleClient::convert_message(&msg);
        match converted {
            ChatMessage::Assistant { tool_calls: Some(calls), .. } => {
                assert_eq!(calls.len(), 1);
                assert_eq!(calls[0].function.name, "search");
            }
            _ => panic!("expected assistant message with tool calls"),
        }
    }
}
