//! Streaming Orchestrator — the hub that drives one user turn from the
//! first LLM stream through any tool calls to a finalized, permanent
//! message.
//!
//! Wires together the pieces built elsewhere in this crate:
//! `StreamingSession` accumulates one iteration's events, `ToolExecutor`
//! dispatches client-side tool calls, `ChatActionManager` signals platform
//! presence, and a per-platform `DraftHandle` renders the in-progress text.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::chat_action::{ChatActionManager, Phase};
use crate::provider::{ChatRequest, LlmProvider, ProviderError, StopReason};
use crate::session::{PendingTool, StreamingSession};
use crate::stream::StreamEvent;
use crate::tools::executor::{ExecutorCallbacks, ToolExecResult, ToolExecutor};
use crate::tools::{Tool, ToolFileOutput};
use skynet_queue::{EnvelopeKind, QueueStore};

/// Safety cap on the number of stream→tool round trips within one turn.
const MAX_ITERATIONS: u32 = 100;

/// Platform-side handle to a pending draft message. Each platform adapter
/// (Telegram, …) implements this against its own draft/edit primitive; the
/// orchestrator only ever calls through the trait.
#[async_trait]
pub trait DraftHandle: Send + Sync {
    /// Reflect `text` in the draft. Throttling/coalescing is the
    /// implementation's responsibility — the orchestrator calls this on
    /// every renderable event.
    async fn update(&self, text: &str, force: bool);

    /// Refresh the draft so the platform doesn't time it out. Called by the
    /// implementation's own internal keepalive task, not by the
    /// orchestrator directly — part of the trait surface so that task can
    /// be generic over platforms too.
    async fn keepalive(&self);

    /// Convert the draft into a permanent message. `final_text`, when
    /// given, overrides the last text sent to `update` — used to strip
    /// tool markers from the user-visible version.
    async fn finalize(&self, final_text: Option<&str>);

    /// Abandon the draft without sending anything.
    async fn clear(&self);
}

/// Outcome of one `Orchestrator::stream` call.
#[derive(Debug, Clone, Default)]
pub struct StreamResult {
    /// Final permanent text, tool markers stripped.
    pub text: String,
    /// Last text rendered to the draft, including tool markers.
    pub display_text: String,
    pub was_cancelled: bool,
    pub cancellation_reason: Option<String>,
    /// `true` when a turn-break tool fired — the caller must re-enter
    /// `stream` with the returned `conversation` to continue the turn.
    pub needs_continuation: bool,
    pub conversation: Vec<serde_json::Value>,
    pub has_sent_parts: bool,
    pub has_delivered_files: bool,
    /// File bytes produced by turn-break tools this call, ready for the
    /// caller to ship to the platform before resuming with `conversation`.
    pub delivered_files: Vec<ToolFileOutput>,
    pub iterations: u32,
    pub thinking_chars: usize,
    pub output_chars: usize,
    /// The final assistant turn's content-block array, citations stripped,
    /// ready to store as a `Message.content_blob` — callers persisting
    /// thread history need this to replay thinking-block signatures
    /// byte-identical on the next turn.
    pub final_message_blocks: Vec<serde_json::Value>,
    /// Input/output token counts summed across every stream→tool iteration
    /// of this turn — the figure the Balance Gate charges against.
    pub tokens_in: u32,
    pub tokens_out: u32,
}

/// Drives one turn. Borrowed references keep this cheap to construct per
/// request; nothing here outlives the call to `stream`.
pub struct Orchestrator<'a> {
    provider: &'a dyn LlmProvider,
    tools: &'a [Box<dyn Tool>],
    draft: &'a dyn DraftHandle,
    chat_action: Arc<ChatActionManager>,
    /// Write-behind queue for `ToolCall` history. `None` in tests and other
    /// contexts that don't need durable tool-invocation logging.
    queue: Option<Arc<QueueStore>>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        provider: &'a dyn LlmProvider,
        tools: &'a [Box<dyn Tool>],
        draft: &'a dyn DraftHandle,
        chat_action: Arc<ChatActionManager>,
        queue: Option<Arc<QueueStore>>,
    ) -> Self {
        Self {
            provider,
            tools,
            draft,
            chat_action,
            queue,
        }
    }

    fn is_client_tool(&self, name: &str) -> bool {
        self.tools.iter().any(|t| t.name() == name)
    }

    /// Drive the turn to completion, or until a turn-break tool requests a
    /// continuation, cancellation fires, or `MAX_ITERATIONS` is hit.
    ///
    /// `request_template` supplies model/system/tools/thinking settings;
    /// its `raw_messages` is overwritten each iteration with the live
    /// `conversation`.
    pub async fn stream(
        &self,
        mut conversation: Vec<serde_json::Value>,
        request_template: ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<StreamResult, ProviderError> {
        let mut thinking_chars = 0usize;
        let mut output_chars = 0usize;
        let mut has_sent_parts = false;
        let mut has_delivered_files = false;
        let mut delivered_files: Vec<ToolFileOutput> = Vec::new();
        let mut tokens_in = 0u32;
        let mut tokens_out = 0u32;

        for iteration in 0..MAX_ITERATIONS {
            let gen_scope = self.chat_action.push_scope(Phase::Generating, None);

            let mut req = request_template.clone();
            req.raw_messages = Some(conversation.clone());

            let (tx, mut rx) = mpsc::channel::<StreamEvent>(64);
            let mut session = StreamingSession::new();
            let mut send_fut = Box::pin(self.provider.send_stream(&req, tx));
            let mut send_done = false;
            let mut stream_err: Option<ProviderError> = None;
            let mut cancelled = false;

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        cancelled = true;
                        break;
                    }

                    maybe_event = rx.recv() => {
                        match maybe_event {
                            Some(event) => {
                                match &event {
                                    StreamEvent::Thinking { text } => thinking_chars += text.len(),
                                    StreamEvent::TextDelta { text } => output_chars += text.len(),
                                    StreamEvent::Done { tokens_in: ti, tokens_out: to, .. } => {
                                        tokens_in += ti;
                                        tokens_out += to;
                                    }
                                    StreamEvent::Error { message } => {
                                        warn!(message = %message, "stream reported an error event");
                                    }
                                    _ => {}
                                }
                                if let Some(rendered) = session.apply(&event) {
                                    self.draft.update(&rendered, false).await;
                                }
                            }
                            None => break,
                        }
                    }

                    res = &mut send_fut, if !send_done => {
                        send_done = true;
                        if let Err(e) = res {
                            stream_err = Some(e);
                        }
                    }
                }
            }

            self.chat_action.pop_scope(gen_scope);

            if cancelled {
                let final_text = format!("{}\n\n_[interrupted]_", session.render_final());
                self.draft.finalize(Some(&final_text)).await;
                return Ok(StreamResult {
                    text: final_text,
                    display_text: session.render(),
                    was_cancelled: true,
                    cancellation_reason: Some("user requested /stop".to_string()),
                    needs_continuation: false,
                    conversation,
                    has_sent_parts,
                    has_delivered_files,
                    delivered_files: delivered_files.clone(),
                    iterations: iteration + 1,
                    thinking_chars,
                    output_chars,
                    final_message_blocks: strip_api_only_fields(&session.captured_message),
                    tokens_in,
                    tokens_out,
                });
            }

            if let Some(e) = stream_err {
                return Err(e);
            }

            match session.stop_reason.clone() {
                Some(StopReason::EndTurn) | Some(StopReason::PauseTurn) => {
                    let final_text = session.render_final();
                    self.draft.finalize(Some(&final_text)).await;
                    return Ok(StreamResult {
                        text: final_text,
                        display_text: session.render(),
                        was_cancelled: false,
                        cancellation_reason: None,
                        needs_continuation: false,
                        conversation,
                        has_sent_parts,
                        has_delivered_files,
                        delivered_files: delivered_files.clone(),
                        iterations: iteration + 1,
                        thinking_chars,
                        output_chars,
                        final_message_blocks: strip_api_only_fields(&session.captured_message),
                        tokens_in,
                        tokens_out,
                    });
                }

                Some(StopReason::ToolUse) => {
                    let client_pending: HashMap<String, PendingTool> = session
                        .pending_tools
                        .iter()
                        .filter(|(_, pending)| self.is_client_tool(&pending.name))
                        .map(|(id, pending)| (id.clone(), pending.clone()))
                        .collect();

                    let assistant_message = serde_json::json!({
                        "role": "assistant",
                        "content": strip_api_only_fields(&session.captured_message),
                    });

                    if client_pending.is_empty() {
                        // Every tool_use block in this turn was resolved
                        // server-side; nothing to execute, just carry the
                        // turn forward.
                        conversation.push(assistant_message);
                        continue;
                    }

                    let proc_scope = self.chat_action.push_scope(Phase::Processing, None);
                    let executor = ToolExecutor::new(self.tools);
                    let callbacks = ExecutorCallbacks::default();
                    let batch = executor
                        .execute_batch(&client_pending, cancel, &callbacks)
                        .await;
                    self.chat_action.pop_scope(proc_scope);

                    if let Some(queue) = &self.queue {
                        for r in &batch.results {
                            let payload = serde_json::json!({
                                "tool_call_id": r.tool_call_id,
                                "name": r.name,
                                "is_error": r.result.is_error,
                                "duration_ms": r.duration.as_millis() as u64,
                            });
                            if let Err(e) = queue.push(EnvelopeKind::ToolCall, payload) {
                                warn!("failed to enqueue tool call history: {e}");
                            }
                        }
                    }

                    if batch.cancelled {
                        let final_text = format!("{}\n\n_[interrupted]_", session.render_final());
                        self.draft.finalize(Some(&final_text)).await;
                        return Ok(StreamResult {
                            text: final_text,
                            display_text: session.render(),
                            was_cancelled: true,
                            cancellation_reason: Some("cancelled during tool execution".to_string()),
                            needs_continuation: false,
                            conversation,
                            has_sent_parts,
                            has_delivered_files,
                            delivered_files: delivered_files.clone(),
                            iterations: iteration + 1,
                            thinking_chars,
                            output_chars,
                            final_message_blocks: strip_api_only_fields(&session.captured_message),
                            tokens_in,
                            tokens_out,
                        });
                    }

                    let new_files: Vec<ToolFileOutput> =
                        batch.results.iter().filter_map(|r| r.result.file.clone()).collect();
                    if !new_files.is_empty() {
                        has_delivered_files = true;
                        delivered_files.extend(new_files);
                    }

                    conversation.push(assistant_message);
                    conversation.push(serde_json::json!({
                        "role": "user",
                        "content": tool_result_blocks(&session, &batch.results),
                    }));

                    if batch.turn_break {
                        let final_text = session.render_final();
                        self.draft.finalize(Some(&final_text)).await;
                        has_sent_parts = true;
                        return Ok(StreamResult {
                            text: final_text,
                            display_text: session.render(),
                            was_cancelled: false,
                            cancellation_reason: None,
                            needs_continuation: true,
                            conversation,
                            has_sent_parts,
                            has_delivered_files,
                            delivered_files: delivered_files.clone(),
                            iterations: iteration + 1,
                            thinking_chars,
                            output_chars,
                            final_message_blocks: strip_api_only_fields(&session.captured_message),
                            tokens_in,
                            tokens_out,
                        });
                    }

                    // No turn break — keep streaming in the same visible
                    // draft, the model picks up with the tool results.
                    continue;
                }

                other => {
                    let reason = other.unwrap_or(StopReason::Other("none".to_string()));
                    let mut final_text = session.render_final();
                    match reason {
                        StopReason::MaxTokens => {
                            info!("stream stopped at max_tokens");
                        }
                        StopReason::Refusal => {
                            final_text.push_str("\n\n_[response declined]_");
                        }
                        StopReason::ModelContextWindowExceeded => {
                            final_text.push_str(
                                "\n\n_[context window exceeded — start a new conversation]_",
                            );
                        }
                        _ => {
                            warn!(?reason, "unexpected stop reason");
                            final_text.push_str("\n\n_[unexpected stop]_");
                        }
                    }
                    self.draft.finalize(Some(&final_text)).await;
                    return Ok(StreamResult {
                        text: final_text,
                        display_text: session.render(),
                        was_cancelled: false,
                        cancellation_reason: None,
                        needs_continuation: false,
                        conversation,
                        has_sent_parts,
                        has_delivered_files,
                        delivered_files: delivered_files.clone(),
                        iterations: iteration + 1,
                        thinking_chars,
                        output_chars,
                        final_message_blocks: strip_api_only_fields(&session.captured_message),
                        tokens_in,
                        tokens_out,
                    });
                }
            }
        }

        warn!(MAX_ITERATIONS, "orchestrator hit maximum iterations");
        let final_text = "_[this turn took too many steps and was stopped]_".to_string();
        self.draft.finalize(Some(&final_text)).await;
        Ok(StreamResult {
            text: final_text,
            display_text: String::new(),
            was_cancelled: false,
            cancellation_reason: None,
            needs_continuation: false,
            conversation,
            has_sent_parts,
            has_delivered_files,
            delivered_files: delivered_files.clone(),
            iterations: MAX_ITERATIONS,
            thinking_chars,
            output_chars,
            final_message_blocks: Vec::new(),
            tokens_in: 0,
            tokens_out: 0,
        })
    }
}

/// Build the `tool_result` content blocks for a completed batch, ordered to
/// match the `tool_use` blocks in `session.captured_message` so the
/// `tool_results` array lines up 1:1 with the requests the model made —
/// batch completion order is not dispatch order.
fn tool_result_blocks(
    session: &StreamingSession,
    results: &[ToolExecResult],
) -> Vec<serde_json::Value> {
    let mut by_id: HashMap<&str, &ToolExecResult> =
        results.iter().map(|r| (r.tool_call_id.as_str(), r)).collect();

    session
        .captured_message
        .iter()
        .filter(|block| block.get("type").and_then(|t| t.as_str()) == Some("tool_use"))
        .filter_map(|block| block.get("id").and_then(|i| i.as_str()))
        .filter_map(|id| by_id.remove(id))
        .map(|r| {
            serde_json::json!({
                "type": "tool_result",
                "tool_use_id": r.tool_call_id,
                "content": [{"type": "text", "text": r.result.content}],
                "is_error": r.result.is_error,
            })
        })
        .collect()
}

/// Strip API-only fields (citations) from a captured content-block array
/// before it's re-appended to `conversation`. Thinking, redacted-thinking,
/// and tool_use blocks — and their signatures — pass through byte-identical.
fn strip_api_only_fields(blocks: &[serde_json::Value]) -> Vec<serde_json::Value> {
    blocks
        .iter()
        .cloned()
        .map(|mut block| {
            strip_citations(&mut block);
            block
        })
        .collect()
}

fn strip_citations(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            map.remove("citations");
            for v in map.values_mut() {
                strip_citations(v);
            }
        }
        serde_json::Value::Array(items) => {
            for v in items.iter_mut() {
                strip_citations(v);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ChatResponse, ProviderError as PErr, TokenInfo};
    use crate::tools::ToolResult;
    use async_trait::async_trait as at;
    use std::sync::Mutex;

    struct ScriptedProvider {
        events: Mutex<Vec<Vec<StreamEvent>>>,
    }

    #[at]
    impl LlmProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn send(&self, _req: &ChatRequest) -> Result<ChatResponse, PErr> {
            unimplemented!("test provider is stream-only")
        }

        async fn send_stream(
            &self,
            _req: &ChatRequest,
            tx: mpsc::Sender<StreamEvent>,
        ) -> Result<(), PErr> {
            let batch = self.events.lock().unwrap().remove(0);
            for event in batch {
                let _ = tx.send(event).await;
            }
            Ok(())
        }

        fn token_info(&self) -> Option<TokenInfo> {
            None
        }
    }

    struct RecordingDraft {
        updates: Mutex<Vec<String>>,
        finalized: Mutex<Option<String>>,
    }

    impl RecordingDraft {
        fn new() -> Self {
            Self {
                updates: Mutex::new(Vec::new()),
                finalized: Mutex::new(None),
            }
        }
    }

    #[at]
    impl DraftHandle for RecordingDraft {
        async fn update(&self, text: &str, _force: bool) {
            self.updates.lock().unwrap().push(text.to_string());
        }

        async fn keepalive(&self) {}

        async fn finalize(&self, final_text: Option<&str>) {
            *self.finalized.lock().unwrap() = final_text.map(|s| s.to_string());
        }

        async fn clear(&self) {
            *self.finalized.lock().unwrap() = Some(String::new());
        }
    }

    struct NoopSink;

    #[at]
    impl crate::chat_action::ChatActionSink for NoopSink {
        async fn send_action(&self, _action: crate::chat_action::ActionKind) {}
    }

    fn text_turn(text: &str) -> Vec<StreamEvent> {
        vec![
            StreamEvent::BlockStart {
                index: 0,
                block_type: "text".into(),
                tool_id: None,
                tool_name: None,
            },
            StreamEvent::TextDelta { text: text.into() },
            StreamEvent::BlockEnd { index: 0 },
            StreamEvent::Done {
                model: "claude".into(),
                tokens_in: 10,
                tokens_out: 5,
                stop_reason: "end_turn".into(),
            },
        ]
    }

    fn base_request() -> ChatRequest {
        ChatRequest {
            model: "claude".into(),
            system: String::new(),
            system_prompt: None,
            messages: Vec::new(),
            max_tokens: 1024,
            stream: true,
            thinking: None,
            tools: Vec::new(),
            raw_messages: None,
        }
    }

    #[tokio::test]
    async fn end_turn_finalizes_and_returns_text() {
        let provider = ScriptedProvider {
            events: Mutex::new(vec![text_turn("hello there")]),
        };
        let tools: Vec<Box<dyn Tool>> = Vec::new();
        let draft = RecordingDraft::new();
        let chat_action = ChatActionManager::new(Arc::new(NoopSink));
        let orchestrator = Orchestrator::new(&provider, &tools, &draft, chat_action, None);

        let cancel = CancellationToken::new();
        let result = orchestrator
            .stream(Vec::new(), base_request(), &cancel)
            .await
            .unwrap();

        assert_eq!(result.text, "hello there");
        assert!(!result.was_cancelled);
        assert!(!result.needs_continuation);
        assert_eq!(draft.finalized.lock().unwrap().as_deref(), Some("hello there"));
    }

    #[tokio::test]
    async fn cancellation_finalizes_with_interrupted_suffix() {
        let provider = ScriptedProvider {
            events: Mutex::new(vec![vec![
                StreamEvent::BlockStart {
                    index: 0,
                    block_type: "text".into(),
                    tool_id: None,
                    tool_name: None,
                },
                StreamEvent::TextDelta { text: "partial".into() },
            ]]),
        };
        let tools: Vec<Box<dyn Tool>> = Vec::new();
        let draft = RecordingDraft::new();
        let chat_action = ChatActionManager::new(Arc::new(NoopSink));
        let orchestrator = Orchestrator::new(&provider, &tools, &draft, chat_action, None);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = orchestrator
            .stream(Vec::new(), base_request(), &cancel)
            .await
            .unwrap();

        assert!(result.was_cancelled);
        assert!(result.text.contains("[interrupted]"));
    }

    struct EchoTool;

    #[at]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echo"
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({})
        }
        async fn execute(&self, input: serde_json::Value) -> ToolResult {
            ToolResult::success(input.to_string())
        }
    }

    #[tokio::test]
    async fn tool_use_without_turn_break_continues_to_next_iteration() {
        let tool_turn = vec![
            StreamEvent::BlockStart {
                index: 0,
                block_type: "tool_use".into(),
                tool_id: Some("t1".into()),
                tool_name: Some("echo".into()),
            },
            StreamEvent::ToolUse {
                id: "t1".into(),
                name: "echo".into(),
                input: serde_json::json!({"x": 1}),
            },
            StreamEvent::BlockEnd { index: 0 },
            StreamEvent::Done {
                model: "claude".into(),
                tokens_in: 10,
                tokens_out: 5,
                stop_reason: "tool_use".into(),
            },
        ];
        let provider = ScriptedProvider {
            events: Mutex::new(vec![tool_turn, text_turn("done")]),
        };
        let tools: Vec<Box<dyn Tool>> = vec![Box::new(EchoTool)];
        let draft = RecordingDraft::new();
        let chat_action = ChatActionManager::new(Arc::new(NoopSink));
        let orchestrator = Orchestrator::new(&provider, &tools, &draft, chat_action, None);

        let cancel = CancellationToken::new();
        let result = orchestrator
            .stream(Vec::new(), base_request(), &cancel)
            .await
            .unwrap();

        assert_eq!(result.text, "done");
        assert_eq!(result.iterations, 2);
        // assistant tool_use turn + tool_result turn were appended.
        assert_eq!(result.conversation.len(), 2);
        assert_eq!(result.conversation[0]["role"], "assistant");
        assert_eq!(result.conversation[1]["role"], "user");
    }

    struct FileTool;

    #[at]
    impl Tool for FileTool {
        fn name(&self) -> &str {
            "deliver_file"
        }
        fn description(&self) -> &str {
            "delivers a file"
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({})
        }
        async fn execute(&self, _input: serde_json::Value) -> ToolResult {
            ToolResult::with_file(
                "delivered",
                crate::tools::ToolFileOutput {
                    filename: "plot.png".into(),
                    mime_type: "image/png".into(),
                    bytes: b"fakepng".to_vec(),
                },
            )
        }
    }

    #[tokio::test]
    async fn turn_break_tool_requests_continuation() {
        let tool_turn = vec![
            StreamEvent::BlockStart {
                index: 0,
                block_type: "tool_use".into(),
                tool_id: Some("t1".into()),
                tool_name: Some("deliver_file".into()),
            },
            StreamEvent::ToolUse {
                id: "t1".into(),
                name: "deliver_file".into(),
                input: serde_json::json!({}),
            },
            StreamEvent::BlockEnd { index: 0 },
            StreamEvent::Done {
                model: "claude".into(),
                tokens_in: 10,
                tokens_out: 5,
                stop_reason: "tool_use".into(),
            },
        ];
        let provider = ScriptedProvider {
            events: Mutex::new(vec![tool_turn]),
        };
        let tools: Vec<Box<dyn Tool>> = vec![Box::new(FileTool)];
        let draft = RecordingDraft::new();
        let chat_action = ChatActionManager::new(Arc::new(NoopSink));
        let orchestrator = Orchestrator::new(&provider, &tools, &draft, chat_action, None);

        let cancel = CancellationToken::new();
        let result = orchestrator
            .stream(Vec::new(), base_request(), &cancel)
            .await
            .unwrap();

        assert!(result.needs_continuation);
        assert!(result.has_delivered_files);
        assert_eq!(result.conversation.len(), 2);
    }
}
