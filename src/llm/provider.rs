use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;

// ============================================================================
// Core Trait
// ============================================================================

/// A streaming chat-completion dependency.
///
/// One call to `stream_turn` issues exactly one upstream completion request
/// and yields the deltas for that single turn (content text, tool-call
/// fragments keyed by a stable per-turn id, then a `Done` marker). Round
/// looping, tool execution, and summarization all live above this trait, in
/// the conversation driver — this is deliberately a thin transport boundary.
#[async_trait::async_trait]
pub trait ChatCompletionClient: Send + Sync {
    /// Get a copy of the current generation configuration.
    fn config(&self) -> ProviderConfig;

    /// Replace the generation configuration.
    fn set_config(&self, cfg: ProviderConfig);

    /// Usage/request statistics accumulated so far. Thread-safe: callable
    /// while a stream is in flight.
    fn state(&self) -> ProviderState;

    /// Issue one streaming chat-completion request for `messages`, offering
    /// `tools` to the model (empty = no tool catalog, used by the
    /// summarizer's non-tooling sub-call).
    async fn stream_turn(
        &self,
        messages: Vec<Message>,
        tools: Vec<Tool>,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<StreamChunk, ProviderError>> + Send>>, ProviderError>;
}

// ============================================================================
// State and Configuration
// ============================================================================

/// Provider state tracking usage statistics
#[derive(Debug, Clone, Default)]
pub struct ProviderState {
    /// Total input tokens used
    pub input_tokens: u64,

    /// Total output tokens used
    pub output_tokens: u64,

    /// Total cached tokens (for providers supporting prompt caching)
    pub cached_tokens: u64,

    /// Number of API requests made
    pub request_count: u64,

    /// Last request timestamp
    pub last_request_time: Option<std::time::SystemTime>,

    /// Provider-specific metadata
    pub metadata: HashMap<String, String>,
}

/// Configuration options for generation
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Temperature (0.0 - 1.0+)
    pub temperature: f32,

    /// Maximum tokens to generate
    pub max_tokens: u32,

    /// System prompt (only used by callers that build their own message list;
    /// `stream_turn` never injects one implicitly)
    pub system_prompt: Option<String>,

    /// Provider-specific options
    pub extra_options: HashMap<String, serde_json::Value>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 4096,
            system_prompt: None,
            extra_options: HashMap::new(),
        }
    }
}

// ============================================================================
// Message Types
// ============================================================================

/// Message role in conversation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Message in conversation history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,

    /// Tool call ID (for tool-result messages)
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tool_call_id: Option<String>,

    /// Tool name (for tool-result messages)
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub name: Option<String>,

    /// Tool calls made by this assistant message
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_call_id: None,
            name: None,
            tool_calls: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_call_id: None,
            name: None,
            tool_calls: None,
        }
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_call_id: None,
            name: None,
            tool_calls: if tool_calls.is_empty() {
                None
            } else {
                Some(tool_calls)
            },
        }
    }

    pub fn tool(tool_call_id: impl Into<String>, name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
            name: Some(name.into()),
            tool_calls: None,
        }
    }

    /// True for an assistant message that still has tool calls pending
    /// execution (the driver's "has_pending_tools" check).
    pub fn has_pending_tool_calls(&self) -> bool {
        self.role == Role::Assistant
            && self
                .tool_calls
                .as_ref()
                .map(|c| !c.is_empty())
                .unwrap_or(false)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.role {
            Role::System => write!(f, "System: {}", self.content),
            Role::User => write!(f, "User: {}", self.content),
            Role::Assistant => write!(f, "Assistant: {}", self.content),
            Role::Tool => write!(f, "Tool: {}", self.content),
        }
    }
}

/// A fully reassembled tool call, ready for dispatch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub function_name: String,
    /// JSON-encoded arguments, verbatim as assembled from streamed deltas.
    pub arguments: String,
}

// ============================================================================
// Tool Definition
// ============================================================================

/// Tool definition offered to the model as part of its catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value, // JSON Schema
}

// ============================================================================
// Helper: Tool Call Assembler
// ============================================================================

/// Reassembles tool-call deltas keyed by a stable per-turn id.
///
/// `id` and `name` are populated only on the first non-empty delta seen for
/// each field; later non-empty deltas for `arguments` are appended. This
/// mirrors exactly how a streaming chat-completion API fragments a function
/// call across many SSE events.
#[derive(Debug, Default)]
pub struct ToolCallAssembler {
    order: Vec<String>,
    calls: HashMap<String, PartialToolCall>,
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: String,
    name: Option<String>,
    arguments: String,
}

impl ToolCallAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process one delta. `id` must already be resolved from whatever
    /// transport-level index the wire format uses.
    pub fn process_delta(&mut self, id: String, name: Option<String>, arguments_delta: Option<String>) {
        if !self.calls.contains_key(&id) {
            self.order.push(id.clone());
        }
        let call = self.calls.entry(id.clone()).or_insert_with(|| PartialToolCall {
            id: id.clone(),
            name: None,
            arguments: String::new(),
        });

        if call.name.is_none() {
            if let Some(n) = name {
                call.name = Some(n);
            }
        }

        if let Some(delta) = arguments_delta {
            if !delta.is_empty() {
                call.arguments.push_str(&delta);
            }
        }
    }

    /// Finish assembly, dropping any call whose id never arrived (empty id),
    /// in the order ids were first observed.
    pub fn into_tool_calls(self) -> Vec<ToolCall> {
        let ToolCallAssembler { order, mut calls } = self;
        order
            .into_iter()
            .filter_map(|id| calls.remove(&id))
            .filter(|c| !c.id.is_empty())
            .map(|partial| ToolCall {
                id: partial.id,
                function_name: partial.name.unwrap_or_default(),
                arguments: partial.arguments,
            })
            .collect()
    }
}

// ============================================================================
// Stream Chunk Types
// ============================================================================

/// One delta out of a single `stream_turn` call.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    /// Text content delta
    Content(String),

    /// One fragment of an in-progress tool call, keyed by a stable id
    /// assigned by the transport for the duration of this turn.
    ToolCallDelta {
        id: String,
        name: Option<String>,
        arguments_delta: Option<String>,
    },

    /// Terminates the turn.
    Done {
        finish_reason: FinishReason,
        usage: TokenUsage,
    },
}

// ============================================================================
// Response Types
// ============================================================================

/// Token usage statistics
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cached_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

/// Reason why generation finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Other(String),
}

// ============================================================================
// Error Types
// ============================================================================

/// Chat-completion client error types
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("API error: {0}")]
    ApiError(String),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembler_populates_id_and_name_once_then_appends_arguments() {
        let mut asm = ToolCallAssembler::new();
        asm.process_delta("a".into(), Some("get_weather".into()), Some("{\"loc".into()));
        asm.process_delta("a".into(), Some("ignored_overwrite".into()), Some("\":\"sf\"}".into()));
        let calls = asm.into_tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function_name, "get_weather");
        assert_eq!(calls[0].arguments, "{\"loc\":\"sf\"}");
    }

    #[test]
    fn assembler_drops_calls_with_empty_id() {
        let mut asm = ToolCallAssembler::new();
        asm.process_delta("".into(), Some("x".into()), Some("{}".into()));
        assert!(asm.into_tool_calls().is_empty());
    }

    #[test]
    fn assembler_preserves_first_seen_order() {
        let mut asm = ToolCallAssembler::new();
        asm.process_delta("b".into(), Some("second".into()), None);
        asm.process_delta("a".into(), Some("first".into()), None);
        asm.process_delta("b".into(), None, Some("{}".into()));
        let calls = asm.into_tool_calls();
        assert_eq!(calls[0].function_name, "second");
        assert_eq!(calls[1].function_name, "first");
    }

    #[test]
    fn has_pending_tool_calls_is_false_without_tool_calls() {
        let msg = Message::assistant("hello", vec![]);
        assert!(!msg.has_pending_tool_calls());
    }

    #[test]
    fn has_pending_tool_calls_is_true_with_tool_calls() {
        let msg = Message::assistant(
            "",
            vec![ToolCall {
                id: "a".into(),
                function_name: "foo".into(),
                arguments: "{}".into(),
            }],
        );
        assert!(msg.has_pending_tool_calls());
    }
}
