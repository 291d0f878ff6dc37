use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::stream::{parse_sse_line, SseParsed, StreamEvent};

/// Parse Anthropic streaming SSE response and emit StreamEvents.
/// Reads from a reqwest byte stream, parses SSE lines, emits events.
pub async fn process_stream(resp: reqwest::Response, tx: mpsc::Sender<StreamEvent>) {
    use futures_util::StreamExt;

    let mut current_event = String::new();
    // Tracks the content block type reported by `content_block_start`
    // ("text", "thinking", or "tool_use") so deltas know what to emit.
    let mut current_block_type = String::new();
    let mut current_block_index: u32 = 0;
    // Tool use accumulation state
    let mut tool_use_id = String::new();
    let mut tool_use_name = String::new();
    let mut tool_use_input_json = String::new();
    let mut model = String::new();
    let mut tokens_in: u32 = 0;
    let mut tokens_out: u32 = 0;
    let mut stop_reason = String::new();
    let mut line_buf = String::new();

    let mut byte_stream = resp.bytes_stream();

    'outer: while let Some(chunk) = byte_stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                let _ = tx
                    .send(StreamEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
                return;
            }
        };

        let text = match std::str::from_utf8(&chunk) {
            Ok(t) => t,
            Err(_) => continue,
        };

        // Anthropic sends SSE: multiple lines per chunk, split by newlines
        line_buf.push_str(text);
        let lines: Vec<&str> = line_buf.split('\n').collect();

        // keep incomplete last line in buffer
        let (complete, remainder) = lines.split_at(lines.len() - 1);
        let remainder = remainder.first().unwrap_or(&"").to_string();

        for line in complete {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if let Some(parsed) = parse_sse_line(line) {
                match parsed {
                    SseParsed::Event(ev) => current_event = ev,
                    SseParsed::Data(data) => {
                        let events = parse_data_block(
                            &current_event,
                            &data,
                            &mut current_block_type,
                            &mut current_block_index,
                            &mut tool_use_id,
                            &mut tool_use_name,
                            &mut tool_use_input_json,
                            &mut model,
                            &mut tokens_in,
                            &mut tokens_out,
                            &mut stop_reason,
                        );
                        for event in events {
                            if tx.send(event).await.is_err() {
                                break 'outer; // receiver dropped
                            }
                        }
                    }
                }
            }
        }

        line_buf = remainder;
    }

    // emit final Done event
    let _ = tx
        .send(StreamEvent::Done {
            model,
            tokens_in,
            tokens_out,
            stop_reason,
        })
        .await;
}

/// Parse a single SSE data block based on the current event type. A block
/// can produce more than one `StreamEvent` (e.g. `content_block_start`
/// always yields `BlockStart`; `content_block_stop` yields `BlockEnd` plus
/// `ToolUse` when the closing block was a tool call).
#[allow(clippy::too_many_arguments)]
fn parse_data_block(
    event_type: &str,
    data: &str,
    current_block_type: &mut String,
    current_block_index: &mut u32,
    tool_use_id: &mut String,
    tool_use_name: &mut String,
    tool_use_input_json: &mut String,
    model: &mut String,
    tokens_in: &mut u32,
    tokens_out: &mut u32,
    stop_reason: &mut String,
) -> Vec<StreamEvent> {
    match event_type {
        "message_start" => {
            // Extract model name and input token count.
            if let Ok(msg) = serde_json::from_str::<MessageStart>(data) {
                *model = msg.message.model;
                *tokens_in = msg.message.usage.input_tokens;
            }
            vec![]
        }

        "content_block_start" => {
            // Record block type so deltas know which StreamEvent to emit.
            // For tool_use blocks, also capture the tool id and name.
            if let Ok(block_start) = serde_json::from_str::<ContentBlockStart>(data) {
                *current_block_index = block_start.index;
                *current_block_type = block_start.content_block.block_type.clone();
                let mut tool_id = None;
                let mut tool_name = None;
                if block_start.content_block.block_type == "tool_use" {
                    *tool_use_id = block_start.content_block.id.clone().unwrap_or_default();
                    *tool_use_name = block_start.content_block.name.clone().unwrap_or_default();
                    tool_use_input_json.clear();
                    tool_id = block_start.content_block.id;
                    tool_name = block_start.content_block.name;
                }
                return vec![StreamEvent::BlockStart {
                    index: block_start.index,
                    block_type: current_block_type.clone(),
                    tool_id,
                    tool_name,
                }];
            }
            vec![]
        }

        "content_block_delta" => {
            if let Ok(delta) = serde_json::from_str::<ContentBlockDelta>(data) {
                match delta.delta.delta_type.as_str() {
                    "text_delta" => {
                        if let Some(text) = delta.delta.text {
                            debug!(len = text.len(), "stream text delta");
                            return vec![StreamEvent::TextDelta { text }];
                        }
                    }
                    "thinking_delta" => {
                        // Anthropic sends thinking content under the `thinking` field.
                        if let Some(text) = delta.delta.thinking {
                            debug!(len = text.len(), "stream thinking delta");
                            return vec![StreamEvent::Thinking { text }];
                        }
                    }
                    "signature_delta" => {
                        // Closes out a thinking block — must be preserved
                        // verbatim if the turn is ever replayed.
                        if let Some(sig) = delta.delta.signature {
                            return vec![StreamEvent::ThinkingSignature { signature: sig }];
                        }
                    }
                    "input_json_delta" => {
                        // Accumulate partial JSON for tool input.
                        if let Some(partial) = delta.delta.partial_json {
                            tool_use_input_json.push_str(&partial);
                        }
                    }
                    other => {
                        debug!(delta_type = other, "unhandled delta type");
                    }
                }
            }
            vec![]
        }

        "content_block_stop" => {
            let index = *current_block_index;
            // When a tool_use block closes, emit a ToolUse event with the
            // fully accumulated JSON input, followed by BlockEnd.
            if current_block_type == "tool_use" {
                let input = serde_json::from_str::<serde_json::Value>(tool_use_input_json.as_str())
                    .unwrap_or(serde_json::Value::Object(Default::default()));

                let tool_use_event = StreamEvent::ToolUse {
                    id: std::mem::take(tool_use_id),
                    name: std::mem::take(tool_use_name),
                    input,
                };
                tool_use_input_json.clear();
                current_block_type.clear();
                return vec![tool_use_event, StreamEvent::BlockEnd { index }];
            }
            current_block_type.clear();
            vec![StreamEvent::BlockEnd { index }]
        }

        "message_delta" => {
            // Extract final usage and stop reason.
            if let Ok(delta) = serde_json::from_str::<MessageDelta>(data) {
                *tokens_out = delta.usage.output_tokens;
                if let Some(reason) = delta.delta.stop_reason {
                    *stop_reason = reason;
                }
            }
            vec![]
        }

        "error" => {
            warn!(data, "anthropic stream error");
            vec![StreamEvent::Error {
                message: data.to_string(),
            }]
        }

        // message_stop and unknown events — no action needed
        _ => vec![],
    }
}

// Anthropic SSE data types (private — deserialization only)

#[derive(Deserialize)]
struct MessageStart {
    message: MessageStartInner,
}

#[derive(Deserialize)]
struct MessageStartInner {
    model: String,
    usage: InputUsage,
}

#[derive(Deserialize)]
struct InputUsage {
    input_tokens: u32,
}

/// Carries the opening metadata for a content block.
/// Used to identify whether the upcoming deltas are "text", "thinking", or "tool_use".
#[derive(Deserialize)]
struct ContentBlockStart {
    index: u32,
    content_block: ContentBlockMeta,
}

#[derive(Deserialize)]
struct ContentBlockMeta {
    #[serde(rename = "type")]
    block_type: String,
    /// Populated for `tool_use` blocks: the tool call id.
    id: Option<String>,
    /// Populated for `tool_use` blocks: the tool name.
    name: Option<String>,
}

#[derive(Deserialize)]
struct ContentBlockDelta {
    delta: DeltaContent,
}

#[derive(Deserialize)]
struct DeltaContent {
    #[serde(rename = "type")]
    delta_type: String,
    /// Populated for `text_delta` events.
    text: Option<String>,
    /// Populated for `thinking_delta` events.
    thinking: Option<String>,
    /// Populated for `signature_delta` events.
    signature: Option<String>,
    /// Populated for `input_json_delta` events (tool input streaming).
    partial_json: Option<String>,
}

#[derive(Deserialize)]
struct MessageDelta {
    delta: MessageDeltaInner,
    usage: OutputUsage,
}

#[derive(Deserialize)]
struct MessageDeltaInner {
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct OutputUsage {
    output_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    struct State {
        block_type: String,
        block_index: u32,
        tool_id: String,
        tool_name: String,
        tool_json: String,
        model: String,
        tokens_in: u32,
        tokens_out: u32,
        stop_reason: String,
    }

    impl State {
        fn new() -> Self {
            Self {
                block_type: String::new(),
                block_index: 0,
                tool_id: String::new(),
                tool_name: String::new(),
                tool_json: String::new(),
                model: String::new(),
                tokens_in: 0,
                tokens_out: 0,
                stop_reason: String::new(),
            }
        }

        fn parse(&mut self, event_type: &str, data: &str) -> Vec<StreamEvent> {
            parse_data_block(
                event_type,
                data,
                &mut self.block_type,
                &mut self.block_index,
                &mut self.tool_id,
                &mut self.tool_name,
                &mut self.tool_json,
                &mut self.model,
                &mut self.tokens_in,
                &mut self.tokens_out,
                &mut self.stop_reason,
            )
        }
    }

    #[test]
    fn emits_block_start_and_end_for_tool_use() {
        let mut state = State::new();
        let start = state.parse(
            "content_block_start",
            r#"{"index":0,"content_block":{"type":"tool_use","id":"t1","name":"read_file"}}"#,
        );
        assert!(matches!(
            &start[0],
            StreamEvent::BlockStart { block_type, tool_id, tool_name, .. }
                if block_type == "tool_use"
                    && tool_id.as_deref() == Some("t1")
                    && tool_name.as_deref() == Some("read_file")
        ));

        let delta = state.parse(
            "content_block_delta",
            r#"{"delta":{"type":"input_json_delta","partial_json":"{\"path\":\"a.txt\"}"}}"#,
        );
        assert!(delta.is_empty());

        let stop = state.parse("content_block_stop", r#"{"index":0}"#);
        assert_eq!(stop.len(), 2);
        assert!(matches!(&stop[0], StreamEvent::ToolUse { name, .. } if name == "read_file"));
        assert!(matches!(stop[1], StreamEvent::BlockEnd { index: 0 }));
    }

    #[test]
    fn emits_thinking_signature_on_signature_delta() {
        let mut state = State::new();
        state.parse(
            "content_block_start",
            r#"{"index":0,"content_block":{"type":"thinking"}}"#,
        );

        let thinking = state.parse(
            "content_block_delta",
            r#"{"delta":{"type":"thinking_delta","thinking":"pondering"}}"#,
        );
        assert!(matches!(&thinking[0], StreamEvent::Thinking { text } if text == "pondering"));

        let sig = state.parse(
            "content_block_delta",
            r#"{"delta":{"type":"signature_delta","signature":"sig-abc"}}"#,
        );
        assert!(
            matches!(&sig[0], StreamEvent::ThinkingSignature { signature } if signature == "sig-abc")
        );

        let stop = state.parse("content_block_stop", r#"{"index":0}"#);
        assert_eq!(stop.len(), 1);
        assert!(matches!(stop[0], StreamEvent::BlockEnd { index: 0 }));
    }

    #[test]
    fn message_delta_captures_stop_reason_and_output_tokens() {
        let mut state = State::new();
        state.parse(
            "message_delta",
            r#"{"delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":5}}"#,
        );
        assert_eq!(state.stop_reason, "tool_use");
        assert_eq!(state.tokens_out, 5);
    }

    #[test]
    fn message_start_captures_model_and_input_tokens() {
        let mut state = State::new();
        state.parse(
            "message_start",
            r#"{"message":{"model":"claude-3","usage":{"input_tokens":10}}}"#,
        );
        assert_eq!(state.model, "claude-3");
        assert_eq!(state.tokens_in, 10);
    }

    #[test]
    fn error_event_emits_error_stream_event() {
        let mut state = State::new();
        let events = state.parse("error", r#"{"type":"overloaded_error"}"#);
        assert!(matches!(&events[0], StreamEvent::Error { message } if message.contains("overloaded_error")));
    }
}
