//! Conversation driver: the round loop binding a streaming chat-completion
//! dependency to the tool broker, with loop-safety, abort, and
//! summarization woven in.

pub mod summarizer;

use futures::{Stream, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::broker::ToolBroker;
use crate::config::RuntimeConfig;
use crate::llm::{
    ChatCompletionClient, LoopAction, LoopDetector, Message, StreamChunk, Tool, ToolCall,
    ToolCallAssembler,
};

const STOP_CONVERSATION_TOOL: &str = "stop_conversation";

/// One unit of output from `drive`. Mirrors the three observable shapes the
/// upstream consumer of a turn can see: assistant text, an incremental tool
/// result fragment, or a terminal error.
#[derive(Debug, Clone)]
pub enum Chunk {
    Content(String),
    ToolStream {
        name: String,
        id: String,
        text: String,
    },
    Error(String),
}

pub struct ConversationDriver {
    client: Arc<dyn ChatCompletionClient>,
    broker: Arc<ToolBroker>,
    config: RuntimeConfig,
    is_aborted: Arc<AtomicBool>,
    loop_detector: Mutex<LoopDetector>,
}

impl ConversationDriver {
    pub fn new(client: Arc<dyn ChatCompletionClient>, broker: Arc<ToolBroker>, config: RuntimeConfig) -> Self {
        Self {
            client,
            broker,
            config,
            is_aborted: Arc::new(AtomicBool::new(false)),
            loop_detector: Mutex::new(LoopDetector::new()),
        }
    }

    /// Signal the in-flight `drive` call to stop at the next phase or chunk
    /// boundary. Idempotent.
    pub fn abort(&self) {
        self.is_aborted.store(true, Ordering::SeqCst);
    }

    fn aborted(&self) -> bool {
        self.is_aborted.load(Ordering::SeqCst)
    }

    /// Drive one turn to completion (or abort, or the round bound),
    /// yielding chunks as they become available.
    pub fn drive<'a>(
        &'a self,
        initial_messages: Vec<Message>,
        tool_catalog: Vec<Tool>,
    ) -> impl Stream<Item = Chunk> + 'a {
        async_stream::stream! {
            let mut messages = initial_messages;
            let mut round: usize = 0;

            log::debug!("conversation_start: {} initial messages", messages.len());

            loop {
                if self.aborted() || round >= self.config.max_rounds {
                    break;
                }

                let mut terminated_early = false;

                // A round always starts with a chat-completion phase, unless
                // the transcript already ends on an assistant message with
                // unexecuted tool calls (a resumed mid-turn transcript).
                let already_pending = messages
                    .last()
                    .map(|m| m.has_pending_tool_calls())
                    .unwrap_or(false);

                if !already_pending {
                    let mut stream = match self.client.stream_turn(messages.clone(), tool_catalog.clone()).await {
                        Ok(s) => s,
                        Err(err) => {
                            yield Chunk::Error(err.to_string());
                            break;
                        }
                    };

                    let mut content = String::new();
                    let mut assembler = ToolCallAssembler::new();

                    while let Some(item) = stream.next().await {
                        if self.aborted() {
                            break;
                        }
                        match item {
                            Ok(StreamChunk::Content(delta)) => {
                                content.push_str(&delta);
                                yield Chunk::Content(delta);
                            }
                            Ok(StreamChunk::ToolCallDelta { id, name, arguments_delta }) => {
                                assembler.process_delta(id, name, arguments_delta);
                            }
                            Ok(StreamChunk::Done { .. }) => break,
                            Err(err) => {
                                yield Chunk::Error(err.to_string());
                                break;
                            }
                        }
                    }

                    if self.aborted() {
                        break;
                    }

                    let tool_calls = assembler.into_tool_calls();
                    messages.push(Message::assistant(content, tool_calls));
                }

                if self.aborted() {
                    break;
                }

                // If the chat-completion phase (just run, or already pending
                // from a resumed transcript) produced tool calls, execute
                // them as part of this same round before looping back for
                // the model's next chat completion.
                let pending_tools = messages
                    .last()
                    .map(|m| m.has_pending_tool_calls())
                    .unwrap_or(false);

                if pending_tools {
                    let tool_calls = messages
                        .last()
                        .and_then(|m| m.tool_calls.clone())
                        .unwrap_or_default();

                    for item in self.run_tool_phase(&mut messages, tool_calls).await {
                        match item {
                            PhaseEvent::Chunk(c) => yield c,
                            PhaseEvent::Terminate => {
                                terminated_early = true;
                            }
                        }
                        if self.aborted() {
                            break;
                        }
                    }
                }

                if self.aborted() || terminated_early {
                    break;
                }

                // The turn is complete once a chat-completion phase yields
                // no tool calls; a round that executed tools always loops
                // back for another chat completion.
                if !pending_tools {
                    break;
                }

                // Checked against the round just completed (pre-increment):
                // summary_interval=2 means "after the 2nd completed round,"
                // not the 1st, so the +1 below turns the 0-indexed counter
                // into a 1-indexed "rounds completed" count before comparing.
                let transcript_bytes: usize = messages.iter().map(|m| m.content.len()).sum();
                if round + 1 >= self.config.summary_interval
                    || transcript_bytes >= self.config.summary_length_threshold
                {
                    messages = summarizer::summarize(&self.client, &messages, &self.config).await;
                    round = 0;
                } else {
                    round += 1;
                }
            }
        }
    }

    /// Tool-execution phase: resolves the stop-conversation sentinel,
    /// dispatches every tool call of the last assistant message, and folds
    /// the loop detector's verdicts in alongside the broker's results.
    async fn run_tool_phase(
        &self,
        messages: &mut Vec<Message>,
        tool_calls: Vec<ToolCall>,
    ) -> Vec<PhaseEvent> {
        let mut events = Vec::new();

        if let Some(stop_call) = tool_calls.iter().find(|c| c.function_name == STOP_CONVERSATION_TOOL) {
            // No tool execution occurs and no tool message is appended: the
            // transcript ends on the assistant message carrying the
            // sentinel call, per the stop-conversation scenario.
            events.push(PhaseEvent::Chunk(Chunk::Content(format!(
                "\nConversation stopped by tool `{}`.\n",
                stop_call.function_name
            ))));
            events.push(PhaseEvent::Terminate);
            return events;
        }

        {
            let mut detector = self.loop_detector.lock().await;
            for call in &tool_calls {
                if let Some(detection) = detector.check(call) {
                    match detection.action {
                        LoopAction::Continue => {}
                        LoopAction::Warn => {
                            if let Some(warning) = detection.warning_message {
                                events.push(PhaseEvent::Chunk(Chunk::Content(warning)));
                            }
                        }
                        LoopAction::Terminate => {
                            events.push(PhaseEvent::Chunk(Chunk::Content(
                                "\nToo many repeated tool calls; ending this turn.\n".to_string(),
                            )));
                            events.push(PhaseEvent::Terminate);
                            return events;
                        }
                    }
                }
            }
        }

        events.push(PhaseEvent::Chunk(Chunk::Content(tool_invocation_banner(&tool_calls))));

        // The broker already accumulates each call's full text for its final
        // event, so the driver only needs to forward chunks, not re-buffer.
        let mut execution = self.broker.execute(&tool_calls);

        while let Some(event) = execution.next().await {
            if self.aborted() {
                // `execute` is a lazily-polled stream: stopping here also
                // stops it from dispatching any tool call after this one.
                break;
            }
            if !event.is_final {
                events.push(PhaseEvent::Chunk(Chunk::ToolStream {
                    name: event.tool_name.clone(),
                    id: event.call_id.clone(),
                    text: event.text.clone(),
                }));
            } else {
                messages.push(Message::tool(
                    event.call_id.clone(),
                    event.tool_name.clone(),
                    event.text.clone(),
                ));
                let notice = if event.is_error {
                    format!("\n`{}` failed.\n", event.tool_name)
                } else {
                    format!("\n`{}` completed.\n", event.tool_name)
                };
                events.push(PhaseEvent::Chunk(Chunk::Content(notice)));
            }
        }

        events
    }
}

enum PhaseEvent {
    Chunk(Chunk),
    Terminate,
}

fn tool_invocation_banner(tool_calls: &[ToolCall]) -> String {
    let mut banner = String::from("\n");
    for call in tool_calls {
        let args_summary: String = if call.arguments.chars().count() > 120 {
            format!("{}…", call.arguments.chars().take(120).collect::<String>())
        } else {
            call.arguments.clone()
        };
        banner.push_str(&format!("**Calling `{}`** with `{}`\n", call.function_name, args_summary));
    }
    banner
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{FinishReason, ProviderConfig, ProviderError, ProviderState, TokenUsage};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn banner_truncates_long_arguments() {
        let call = ToolCall {
            id: "1".into(),
            function_name: "foo".into(),
            arguments: "x".repeat(200),
        };
        let banner = tool_invocation_banner(&[call]);
        assert!(banner.contains("foo"));
        assert!(banner.contains('…'));
    }

    /// Replays one scripted turn (content + tool calls) per `stream_turn`
    /// call, repeating the last scripted turn if called more times than
    /// scripted. Counts calls so tests can assert how many completions the
    /// driver actually issued.
    struct StubClient {
        turns: StdMutex<Vec<Vec<(Option<&'static str>, Option<&'static str>)>>>,
        calls: AtomicUsize,
    }

    impl StubClient {
        fn new(turns: Vec<Vec<(Option<&'static str>, Option<&'static str>)>>) -> Self {
            Self {
                turns: StdMutex::new(turns),
                calls: AtomicUsize::new(0),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
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
            std::pin::Pin<Box<dyn Stream<Item = Result<StreamChunk, ProviderError>> + Send>>,
            ProviderError,
        > {
            let call_index = self.calls.fetch_add(1, Ordering::SeqCst);
            let turns = self.turns.lock().unwrap();
            let turn_index = call_index.min(turns.len().saturating_sub(1));
            let turn = turns[turn_index].clone();
            drop(turns);

            let mut chunks = Vec::new();
            for (content, tool_name) in turn {
                if let Some(text) = content {
                    chunks.push(Ok(StreamChunk::Content(text.to_string())));
                }
                if let Some(name) = tool_name {
                    let id = format!("call_{call_index}");
                    chunks.push(Ok(StreamChunk::ToolCallDelta {
                        id: id.clone(),
                        name: Some(name.to_string()),
                        arguments_delta: Some("{}".to_string()),
                    }));
                }
            }
            chunks.push(Ok(StreamChunk::Done {
                finish_reason: FinishReason::Stop,
                usage: TokenUsage::default(),
            }));
            Ok(Box::pin(futures::stream::iter(chunks)))
        }
    }

    fn driver_with(client: Arc<StubClient>, config: RuntimeConfig) -> (ConversationDriver, Arc<StubClient>) {
        let broker = Arc::new(ToolBroker::new(&config).unwrap());
        let driver = ConversationDriver::new(client.clone(), broker, config);
        (driver, client)
    }

    async fn collect(driver: &ConversationDriver, messages: Vec<Message>) -> Vec<Chunk> {
        let stream = driver.drive(messages, vec![]);
        futures::pin_mut!(stream);
        let mut chunks = Vec::new();
        while let Some(chunk) = stream.next().await {
            chunks.push(chunk);
        }
        chunks
    }

    #[tokio::test]
    async fn plain_answer_with_no_tool_calls_ends_after_one_completion() {
        let client = Arc::new(StubClient::new(vec![vec![(Some("4"), None)]]));
        let (driver, client) = driver_with(client, RuntimeConfig::default());

        let chunks = collect(&driver, vec![Message::system("s"), Message::user("what is 2+2")]).await;

        assert_eq!(client.call_count(), 1);
        assert!(chunks
            .iter()
            .any(|c| matches!(c, Chunk::Content(text) if text == "4")));
    }

    #[tokio::test]
    async fn tool_call_round_loops_back_for_a_second_completion() {
        // First completion calls an (unconfigured, so erroring) tool; the
        // driver must still loop back for a second completion to get the
        // model's response to that tool result, per the spec's
        // "two tool calls then answer" shape.
        let client = Arc::new(StubClient::new(vec![
            vec![(None, Some("ghost_tool"))],
            vec![(Some("done"), None)],
        ]));
        let (driver, client) = driver_with(client, RuntimeConfig::default());

        let chunks = collect(&driver, vec![Message::system("s"), Message::user("do it")]).await;

        assert_eq!(client.call_count(), 2, "driver must issue a second chat completion after tool execution");
        assert!(chunks
            .iter()
            .any(|c| matches!(c, Chunk::Content(text) if text == "done")));
    }

    #[tokio::test]
    async fn round_bound_caps_total_chat_completions() {
        // Every completion calls a tool, so without a round bound this
        // would loop forever.
        let client = Arc::new(StubClient::new(vec![vec![(None, Some("ghost_tool"))]]));
        let mut config = RuntimeConfig::default();
        config.max_rounds = 3;
        config.summary_interval = usize::MAX;
        let (driver, client) = driver_with(client, config);

        let _chunks = collect(&driver, vec![Message::user("loop forever")]).await;

        assert_eq!(client.call_count(), 3);
    }

    #[tokio::test]
    async fn stop_conversation_sentinel_ends_turn_without_tool_execution() {
        let client = Arc::new(StubClient::new(vec![vec![(None, Some(STOP_CONVERSATION_TOOL))]]));
        let (driver, client) = driver_with(client, RuntimeConfig::default());

        let chunks = collect(&driver, vec![Message::user("please stop")]).await;

        assert_eq!(client.call_count(), 1, "no second completion after a stop sentinel");
        assert!(chunks.iter().any(
            |c| matches!(c, Chunk::Content(text) if text.contains("stopped"))
        ));
        assert!(
            !chunks.iter().any(|c| matches!(c, Chunk::ToolStream { .. })),
            "no tool execution should be attempted for the stop sentinel"
        );
    }

    #[tokio::test]
    async fn abort_is_idempotent_and_stops_further_rounds() {
        let client = Arc::new(StubClient::new(vec![vec![(None, Some("ghost_tool"))]]));
        let (driver, _client) = driver_with(client, RuntimeConfig::default());

        driver.abort();
        driver.abort();
        assert!(driver.aborted());

        let chunks = collect(&driver, vec![Message::user("hi")]).await;
        assert!(chunks.is_empty());
    }
}
