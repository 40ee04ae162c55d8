//! Transcript summarization: a non-tooling sub-call against the same
//! streaming chat-completion dependency the driver uses, run between rounds
//! to keep long-running conversations bounded.

use std::sync::Arc;

use crate::config::RuntimeConfig;
use crate::llm::{ChatCompletionClient, Message, Role, StreamChunk};

const SUMMARY_FRAMING: &str = "Summary of the conversation so far:";

/// Summarize `messages`, returning a fresh transcript to resume from. On any
/// failure (sub-call error, empty summary) falls back to returning `messages`
/// unchanged — summarization is an optimization, never a hard requirement of
/// forward progress.
pub async fn summarize(
    client: &Arc<dyn ChatCompletionClient>,
    messages: &[Message],
    config: &RuntimeConfig,
) -> Vec<Message> {
    let system_message = messages.iter().find(|m| m.role == Role::System).cloned();
    let first_user_message = messages.iter().find(|m| m.role == Role::User).cloned();

    let mut sub_conversation = Vec::new();
    if let Some(system) = &system_message {
        sub_conversation.push(system.clone());
    }
    sub_conversation.push(Message::system(config.summary_instruction.clone()));
    sub_conversation.extend(messages.iter().filter(|m| m.role != Role::System).cloned());
    sub_conversation.push(Message::user(config.summary_request.clone()));

    let summary_text = match collect_summary_text(client, sub_conversation).await {
        Ok(text) if !text.trim().is_empty() => text,
        Ok(_) => {
            log::info!("summarizer produced an empty summary; keeping transcript unchanged");
            return messages.to_vec();
        }
        Err(err) => {
            log::warn!("summarizer sub-call failed: {err}; keeping transcript unchanged");
            return messages.to_vec();
        }
    };

    let mut replacement = Vec::new();
    if let Some(system) = system_message {
        replacement.push(system);
    }
    if let Some(user) = first_user_message {
        replacement.push(user);
    }
    replacement.push(Message::assistant(
        format!("{SUMMARY_FRAMING} {summary_text}"),
        vec![],
    ));
    replacement
}

async fn collect_summary_text(
    client: &Arc<dyn ChatCompletionClient>,
    sub_conversation: Vec<Message>,
) -> Result<String, crate::llm::ProviderError> {
    use futures::StreamExt;

    let mut stream = client.stream_turn(sub_conversation, vec![]).await?;
    let mut text = String::new();
    while let Some(item) = stream.next().await {
        match item? {
            StreamChunk::Content(delta) => text.push_str(&delta),
            StreamChunk::ToolCallDelta { .. } => {}
            StreamChunk::Done { .. } => break,
        }
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::Stream;
    use std::pin::Pin;

    use crate::llm::{FinishReason, ProviderConfig, ProviderError, ProviderState, Tool, TokenUsage};

    struct StubClient {
        content: &'static str,
        fail: bool,
    }

    #[async_trait]
    impl ChatCompletionClient for StubClient {
        fn config(&self) -> ProviderConfig {
            ProviderConfig::default()
        }
        fn set_config(&self, _cfg: ProviderConfig) {}
        fn state(&self) -> ProviderState {
            ProviderState::default()
        }
        async fn stream_turn(
            &self,
            _messages: Vec<Message>,
            _tools: Vec<Tool>,
        ) -> Result<
            Pin<Box<dyn Stream<Item = Result<StreamChunk, ProviderError>> + Send>>,
            ProviderError,
        > {
            if self.fail {
                return Err(ProviderError::ApiError("boom".into()));
            }
            let content = self.content;
            let chunks = vec![
                Ok(StreamChunk::Content(content.to_string())),
                Ok(StreamChunk::Done {
                    finish_reason: FinishReason::Stop,
                    usage: TokenUsage::default(),
                }),
            ];
            Ok(Box::pin(futures::stream::iter(chunks)))
        }
    }

    fn config() -> RuntimeConfig {
        RuntimeConfig::default()
    }

    #[tokio::test]
    async fn replaces_transcript_with_framed_summary() {
        let client: Arc<dyn ChatCompletionClient> = Arc::new(StubClient {
            content: "the user wants X",
            fail: false,
        });
        let messages = vec![
            Message::system("be helpful"),
            Message::user("do X"),
            Message::assistant("ok", vec![]),
        ];
        let replacement = summarize(&client, &messages, &config()).await;
        assert_eq!(replacement.len(), 3);
        assert_eq!(replacement[0].role, Role::System);
        assert_eq!(replacement[1].role, Role::User);
        assert!(replacement[2].content.contains("the user wants X"));
        assert!(replacement[2].content.starts_with(SUMMARY_FRAMING));
    }

    #[tokio::test]
    async fn sub_call_failure_returns_original_messages() {
        let client: Arc<dyn ChatCompletionClient> = Arc::new(StubClient {
            content: "",
            fail: true,
        });
        let messages = vec![Message::user("hello")];
        let replacement = summarize(&client, &messages, &config()).await;
        assert_eq!(replacement.len(), 1);
        assert_eq!(replacement[0].content, "hello");
    }

    #[tokio::test]
    async fn empty_summary_returns_original_messages() {
        let client: Arc<dyn ChatCompletionClient> = Arc::new(StubClient {
            content: "   ",
            fail: false,
        });
        let messages = vec![Message::user("hello")];
        let replacement = summarize(&client, &messages, &config()).await;
        assert_eq!(replacement.len(), 1);
        assert_eq!(replacement[0].content, "hello");
    }
}
