use std::collections::HashMap;

use crate::provider::StopReason;
use crate::stream::StreamEvent;

/// One renderable unit of an in-progress or finished assistant turn.
#[derive(Debug, Clone)]
pub enum DisplayBlock {
    Text(String),
    Thinking(String),
    /// A tool call in flight or finished; `output` is filled in once the
    /// tool executor reports a result.
    ToolUse {
        id: String,
        name: String,
        is_server_tool: bool,
        output: Option<String>,
    },
}

/// A tool call the model has requested, awaiting dispatch by the tool executor.
#[derive(Debug, Clone)]
pub struct PendingTool {
    pub name: String,
    pub input: serde_json::Value,
    pub is_server_tool: bool,
}

/// Pure state object over one LLM stream iteration. Event-handler methods
/// mutate state and return the freshly rendered display string; they never
/// perform I/O themselves — the orchestrator forwards the render to the
/// draft streamer.
#[derive(Debug, Clone)]
pub struct StreamingSession {
    pub display: Vec<DisplayBlock>,
    pub pending_tools: HashMap<String, PendingTool>,
    /// The content-block array this iteration produced, built up verbatim
    /// (including thinking signatures) so it can be persisted and replayed
    /// unchanged on a later turn.
    pub captured_message: Vec<serde_json::Value>,
    pub stop_reason: Option<StopReason>,
    /// Text segments already committed to a permanent message, because a
    /// tool about to emit a file forced an intermediate draft commit.
    pub sent_parts: Vec<String>,
    current_thinking_signature: Option<String>,
    /// The content block under construction for the currently open index,
    /// built up verbatim from stream events (including the thinking
    /// signature) so it can be pushed onto `captured_message` unchanged
    /// once its `BlockEnd` arrives.
    current_raw_block: Option<serde_json::Value>,
}

impl Default for StreamingSession {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamingSession {
    pub fn new() -> Self {
        Self {
            display: Vec::new(),
            pending_tools: HashMap::new(),
            captured_message: Vec::new(),
            stop_reason: None,
            sent_parts: Vec::new(),
            current_thinking_signature: None,
            current_raw_block: None,
        }
    }

    /// Apply a stream event to this session's state. Returns the freshly
    /// rendered display string when the event changes what should be shown.
    pub fn apply(&mut self, event: &StreamEvent) -> Option<String> {
        match event {
            StreamEvent::BlockStart {
                block_type,
                tool_id,
                tool_name,
                ..
            } => {
                match block_type.as_str() {
                    "tool_use" => {
                        self.display.push(DisplayBlock::ToolUse {
                            id: tool_id.clone().unwrap_or_default(),
                            name: tool_name.clone().unwrap_or_default(),
                            is_server_tool: false,
                            output: None,
                        });
                    }
                    "thinking" => self.display.push(DisplayBlock::Thinking(String::new())),
                    _ => self.display.push(DisplayBlock::Text(String::new())),
                }
                self.current_raw_block = Some(match block_type.as_str() {
                    "tool_use" => serde_json::json!({
                        "type": "tool_use",
                        "id": tool_id.clone().unwrap_or_default(),
                        "name": tool_name.clone().unwrap_or_default(),
                        "input": {},
                    }),
                    "thinking" => serde_json::json!({ "type": "thinking", "thinking": "" }),
                    _ => serde_json::json!({ "type": "text", "text": "" }),
                });
                Some(self.render())
            }

            StreamEvent::TextDelta { text } => {
                self.append_to_last_text(text);
                append_json_field(&mut self.current_raw_block, "text", text);
                Some(self.render())
            }

            StreamEvent::Thinking { text } => {
                self.append_to_last_thinking(text);
                append_json_field(&mut self.current_raw_block, "thinking", text);
                Some(self.render())
            }

            StreamEvent::ThinkingSignature { signature } => {
                self.current_thinking_signature = Some(signature.clone());
                if let Some(block) = &mut self.current_raw_block {
                    block["signature"] = serde_json::Value::String(signature.clone());
                }
                None
            }

            StreamEvent::ToolUse { id, name, input } => {
                self.tool_use_start(id, name, false);
                self.tool_input_complete(id, name, input.clone(), false);
                self.current_raw_block = Some(serde_json::json!({
                    "type": "tool_use",
                    "id": id,
                    "name": name,
                    "input": input,
                }));
                Some(self.render())
            }

            StreamEvent::BlockEnd { .. } => {
                self.current_thinking_signature = None;
                if let Some(block) = self.current_raw_block.take() {
                    self.captured_message.push(block);
                }
                None
            }

            StreamEvent::Done { stop_reason, .. } => {
                self.stop_reason = Some(StopReason::parse(stop_reason));
                None
            }

            StreamEvent::Error { .. } => None,
        }
    }

    /// Close any open text/thinking blocks and insert a tool marker display
    /// block. Mirrors the contract's `tool_use_start(id, name, is_server)`.
    pub fn tool_use_start(&mut self, id: &str, name: &str, is_server: bool) {
        if !self
            .display
            .iter()
            .any(|b| matches!(b, DisplayBlock::ToolUse { id: existing, .. } if existing == id))
        {
            self.display.push(DisplayBlock::ToolUse {
                id: id.to_string(),
                name: name.to_string(),
                is_server_tool: is_server,
                output: None,
            });
        }
    }

    /// Record a completed tool input. Client-side tools are queued for the
    /// tool executor; server-side tools are executed by the provider itself
    /// and exist in this session only for display.
    pub fn tool_input_complete(
        &mut self,
        id: &str,
        name: &str,
        input: serde_json::Value,
        is_server: bool,
    ) {
        if !is_server {
            self.pending_tools.insert(
                id.to_string(),
                PendingTool {
                    name: name.to_string(),
                    input,
                    is_server_tool: is_server,
                },
            );
        }
    }

    /// Override the captured content blocks wholesale — used when a
    /// provider hands back the full block array directly (non-streaming
    /// fallback) instead of it being assembled from `BlockEnd` events.
    pub fn stream_complete(&mut self, final_message: Vec<serde_json::Value>) {
        self.captured_message = final_message;
    }

    fn append_to_last_text(&mut self, chunk: &str) {
        match self.display.last_mut() {
            Some(DisplayBlock::Text(existing)) => existing.push_str(chunk),
            _ => self.display.push(DisplayBlock::Text(chunk.to_string())),
        }
    }

    fn append_to_last_thinking(&mut self, chunk: &str) {
        match self.display.last_mut() {
            Some(DisplayBlock::Thinking(existing)) => existing.push_str(chunk),
            _ => self.display.push(DisplayBlock::Thinking(chunk.to_string())),
        }
    }

    /// Render the permanent, user-facing text: identical to `render()` but
    /// tool markers are omitted entirely rather than shown as `[name...]`.
    /// Used by the orchestrator when finalizing a draft into a permanent
    /// message — tool-use chatter belongs on the draft only.
    pub fn render_final(&self) -> String {
        let mut out = String::new();
        for block in &self.display {
            match block {
                DisplayBlock::Text(text) => out.push_str(text),
                DisplayBlock::Thinking(text) => {
                    if !out.is_empty() {
                        out.push('\n');
                    }
                    out.push('_');
                    out.push_str(text);
                    out.push('_');
                }
                DisplayBlock::ToolUse { .. } => {}
            }
        }
        out
    }

    /// Concatenate display blocks into a single rich string. Thinking is
    /// rendered as italics while streaming (no signature yet to fold it into
    /// a final expandable quote); tool markers render inline as `[tool: name]`.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for block in &self.display {
            match block {
                DisplayBlock::Text(text) => out.push_str(text),
                DisplayBlock::Thinking(text) => {
                    if !out.is_empty() {
                        out.push('\n');
                    }
                    out.push('_');
                    out.push_str(text);
                    out.push('_');
                }
                DisplayBlock::ToolUse { name, output, .. } => {
                    if !out.is_empty() {
                        out.push('\n');
                    }
                    match output {
                        Some(result) => out.push_str(&format!("[{name}: {result}]")),
                        None => out.push_str(&format!("[{name}...]")),
                    }
                }
            }
        }
        out
    }
}

/// Append `chunk` onto `block[field]`, treating a missing/non-string value
/// as an empty string to start from.
fn append_json_field(block: &mut Option<serde_json::Value>, field: &str, chunk: &str) {
    let Some(block) = block else { return };
    let existing = block.get(field).and_then(|v| v.as_str()).unwrap_or("");
    let updated = format!("{existing}{chunk}");
    block[field] = serde_json::Value::String(updated);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_delta_accumulates_into_display() {
        let mut session = StreamingSession::new();
        session.apply(&StreamEvent::BlockStart {
            index: 0,
            block_type: "text".into(),
            tool_id: None,
            tool_name: None,
        });
        session.apply(&StreamEvent::TextDelta { text: "hel".into() });
        let rendered = session.apply(&StreamEvent::TextDelta { text: "lo".into() });
        assert_eq!(rendered, Some("hello".to_string()));
    }

    #[test]
    fn tool_use_start_closes_text_and_adds_marker() {
        let mut session = StreamingSession::new();
        session.apply(&StreamEvent::BlockStart {
            index: 0,
            block_type: "text".into(),
            tool_id: None,
            tool_name: None,
        });
        session.apply(&StreamEvent::TextDelta {
            text: "checking...".into(),
        });
        session.apply(&StreamEvent::BlockStart {
            index: 1,
            block_type: "tool_use".into(),
            tool_id: Some("t1".into()),
            tool_name: Some("read_file".into()),
        });
        let rendered = session.render();
        assert!(rendered.contains("checking..."));
        assert!(rendered.contains("[read_file...]"));
    }

    #[test]
    fn tool_input_complete_queues_client_side_tool_only() {
        let mut session = StreamingSession::new();
        session.tool_input_complete("t1", "read_file", serde_json::json!({"path": "a"}), false);
        session.tool_input_complete("t2", "web_search", serde_json::json!({"q": "x"}), true);
        assert!(session.pending_tools.contains_key("t1"));
        assert!(!session.pending_tools.contains_key("t2"));
    }

    #[test]
    fn done_event_records_parsed_stop_reason() {
        let mut session = StreamingSession::new();
        session.apply(&StreamEvent::Done {
            model: "claude".into(),
            tokens_in: 1,
            tokens_out: 2,
            stop_reason: "tool_use".into(),
        });
        assert_eq!(session.stop_reason, Some(StopReason::ToolUse));
    }

    #[test]
    fn thinking_signature_does_not_leak_into_render() {
        let mut session = StreamingSession::new();
        session.apply(&StreamEvent::BlockStart {
            index: 0,
            block_type: "thinking".into(),
            tool_id: None,
            tool_name: None,
        });
        session.apply(&StreamEvent::Thinking {
            text: "reasoning".into(),
        });
        session.apply(&StreamEvent::ThinkingSignature {
            signature: "sig-1".into(),
        });
        assert!(!session.render().contains("sig-1"));
    }

    #[test]
    fn render_final_omits_tool_markers() {
        let mut session = StreamingSession::new();
        session.apply(&StreamEvent::BlockStart {
            index: 0,
            block_type: "text".into(),
            tool_id: None,
            tool_name: None,
        });
        session.apply(&StreamEvent::TextDelta {
            text: "before".into(),
        });
        session.apply(&StreamEvent::BlockStart {
            index: 1,
            block_type: "tool_use".into(),
            tool_id: Some("t1".into()),
            tool_name: Some("read_file".into()),
        });
        assert!(session.render().contains("[read_file...]"));
        assert_eq!(session.render_final(), "before");
    }

    #[test]
    fn stream_complete_captures_verbatim_message() {
        let mut session = StreamingSession::new();
        let blocks = vec![serde_json::json!({"type": "text", "text": "hi"})];
        session.stream_complete(blocks.clone());
        assert_eq!(session.captured_message, blocks);
    }

    #[test]
    fn captured_message_is_assembled_incrementally_with_signature() {
        let mut session = StreamingSession::new();
        session.apply(&StreamEvent::BlockStart {
            index: 0,
            block_type: "thinking".into(),
            tool_id: None,
            tool_name: None,
        });
        session.apply(&StreamEvent::Thinking {
            text: "rea".into(),
        });
        session.apply(&StreamEvent::Thinking {
            text: "soning".into(),
        });
        session.apply(&StreamEvent::ThinkingSignature {
            signature: "sig-xyz".into(),
        });
        session.apply(&StreamEvent::BlockEnd { index: 0 });

        session.apply(&StreamEvent::BlockStart {
            index: 1,
            block_type: "text".into(),
            tool_id: None,
            tool_name: None,
        });
        session.apply(&StreamEvent::TextDelta {
            text: "the answer".into(),
        });
        session.apply(&StreamEvent::BlockEnd { index: 1 });

        assert_eq!(
            session.captured_message,
            vec![
                serde_json::json!({
                    "type": "thinking",
                    "thinking": "reasoning",
                    "signature": "sig-xyz",
                }),
                serde_json::json!({"type": "text", "text": "the answer"}),
            ]
        );
    }
}
