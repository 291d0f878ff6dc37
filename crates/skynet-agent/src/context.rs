use skynet_memory::Message;
use tracing::debug;

/// Rough characters-per-token ratio used for tail-fit budgeting. Anthropic
/// doesn't expose a local tokenizer; this mirrors the conservative estimate
/// the workspace loader already uses for its own char-based caps.
const CHARS_PER_TOKEN: usize = 4;

/// Percentage of the context window reserved as slack on top of
/// `max_output_tokens`, so a turn never lands exactly at the model's limit.
const DEFAULT_BUFFER_PCT: f32 = 0.1;

/// Budget inputs the orchestrator supplies per turn.
#[derive(Debug, Clone, Copy)]
pub struct FormatOptions {
    pub is_group_chat: bool,
    pub context_window: u32,
    pub max_output_tokens: u32,
    pub buffer_pct: f32,
}

impl FormatOptions {
    pub fn new(is_group_chat: bool, context_window: u32, max_output_tokens: u32) -> Self {
        Self {
            is_group_chat,
            context_window,
            max_output_tokens,
            buffer_pct: DEFAULT_BUFFER_PCT,
        }
    }

    /// Tokens available for message history after output and slack are reserved.
    fn history_budget_tokens(&self) -> u32 {
        let reserved = self.max_output_tokens as f32
            + self.context_window as f32 * self.buffer_pct;
        (self.context_window as f32 - reserved).max(0.0) as u32
    }
}

/// Formats stored `Message` rows into the content list sent to the LLM.
///
/// Assistant turns with a `content_blob` are returned verbatim — rebuilding
/// a thinking block from `text` plus a separate field instead would ship a
/// signature-less block the API rejects on the next turn.
pub struct ContextFormatter;

impl ContextFormatter {
    /// Render a header block for a user message, or `None` when none of the
    /// header-triggering conditions apply.
    fn header_block(message: &Message, is_group_chat: bool) -> Option<String> {
        let needs_header = is_group_chat
            || message.reply.is_some()
            || message.quote.is_some()
            || message.forward.is_some()
            || message.edit_count > 0;

        if !needs_header {
            return None;
        }

        let mut lines = Vec::new();

        let sender = message.sender_display.as_deref().unwrap_or("unknown");
        lines.push(format!("From: {sender}"));

        if let Some(forward) = &message.forward {
            lines.push(format!("Forwarded from {}", forward.display));
        }

        if let Some(reply) = &message.reply {
            lines.push(format!(
                "Replying to {}: \"{}\"",
                reply.sender_display, reply.snippet
            ));
        }

        if let Some(quote) = &message.quote {
            lines.push(format!("Quote: \"{}\"", quote.text));
        }

        if message.edit_count > 0 {
            lines.push(format!("(edited {}x)", message.edit_count));
        }

        Some(lines.join("\n"))
    }

    /// Build the text body for a user message: header block (when
    /// applicable) followed by the message text.
    fn render_user_text(message: &Message, is_group_chat: bool) -> String {
        match Self::header_block(message, is_group_chat) {
            Some(header) => {
                if message.text.is_empty() {
                    header
                } else {
                    format!("{header}\n\n{}", message.text)
                }
            }
            None => message.text.clone(),
        }
    }

    /// Render one message as the content value the provider expects for its
    /// `content` field — either a plain string or, for assistant turns with
    /// a stored blob, the verbatim content-block array.
    fn render_content(message: &Message, is_group_chat: bool) -> serde_json::Value {
        match message.role {
            skynet_memory::MessageRole::Assistant => match &message.content_blob {
                Some(blob) => blob.clone(),
                None => serde_json::Value::String(message.text.clone()),
            },
            skynet_memory::MessageRole::User | skynet_memory::MessageRole::System => {
                serde_json::Value::String(Self::render_user_text(message, is_group_chat))
            }
        }
    }

    /// `true` when a message's content would collapse to nothing — no
    /// non-whitespace text, no non-text block, no attachment. The LLM
    /// rejects empty-content turns, so these must never reach it.
    fn is_effectively_empty(message: &Message) -> bool {
        if message.has_attachments {
            return false;
        }
        if let Some(blob) = &message.content_blob {
            return !blob_has_content(blob);
        }
        message.text.trim().is_empty()
    }

    fn estimate_tokens(value: &serde_json::Value) -> u32 {
        let chars = match value {
            serde_json::Value::String(s) => s.len(),
            other => other.to_string().len(),
        };
        (chars / CHARS_PER_TOKEN).max(1) as u32
    }

    /// Format a message history into the role/content list to send to the
    /// LLM, dropping empty turns and trimming to the tail that fits the
    /// token budget.
    pub fn format(messages: &[Message], opts: &FormatOptions) -> Vec<serde_json::Value> {
        let rendered: Vec<serde_json::Value> = messages
            .iter()
            .filter(|m| !Self::is_effectively_empty(m))
            .map(|m| {
                let role = match m.role {
                    skynet_memory::MessageRole::Assistant => "assistant",
                    skynet_memory::MessageRole::User => "user",
                    skynet_memory::MessageRole::System => "user",
                };
                serde_json::json!({
                    "role": role,
                    "content": Self::render_content(m, opts.is_group_chat),
                })
            })
            .collect();

        let budget = opts.history_budget_tokens();
        let mut total: u32 = 0;
        let mut costs: Vec<u32> = rendered
            .iter()
            .map(|m| Self::estimate_tokens(&m["content"]))
            .collect();
        costs.reverse();

        let mut keep_from_end = 0usize;
        for cost in &costs {
            if keep_from_end > 0 && total + cost > budget {
                break;
            }
            total += cost;
            keep_from_end += 1;
        }

        if keep_from_end < rendered.len() {
            debug!(
                dropped = rendered.len() - keep_from_end,
                budget, total, "context formatter trimmed oldest messages to fit budget"
            );
        }

        let start = rendered.len() - keep_from_end;
        rendered[start..].to_vec()
    }
}

fn blob_has_content(blob: &serde_json::Value) -> bool {
    let Some(blocks) = blob.as_array() else {
        return !blob.is_null();
    };
    blocks.iter().any(|block| match block.get("type").and_then(|t| t.as_str()) {
        Some("text") => block
            .get("text")
            .and_then(|t| t.as_str())
            .map(|t| !t.trim().is_empty())
            .unwrap_or(false),
        Some(_) => true,
        None => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use skynet_core::money::Money;
    use skynet_memory::{ForwardOrigin, ForwardOriginKind, MessageRole, QuoteContext, ReplyContext};

    fn base_message(role: MessageRole, text: &str) -> Message {
        Message {
            id: 1,
            chat_id: "c1".into(),
            platform_message_id: 1,
            thread_id: 1,
            role,
            text: text.to_string(),
            content_blob: None,
            sender_display: Some("Alice".into()),
            reply: None,
            forward: None,
            quote: None,
            has_attachments: false,
            edit_count: 0,
            original_text: None,
            model_used: None,
            tokens_in: 0,
            tokens_out: 0,
            cost: Money::ZERO,
            created_at: "2026-01-01T00:00:00Z".into(),
        }
    }

    #[test]
    fn user_message_in_dm_has_no_header() {
        let msg = base_message(MessageRole::User, "hello");
        let opts = FormatOptions::new(false, 100_000, 4096);
        let out = ContextFormatter::format(&[msg], &opts);
        assert_eq!(out[0]["content"], serde_json::json!("hello"));
    }

    #[test]
    fn group_chat_message_gets_sender_header() {
        let msg = base_message(MessageRole::User, "hello");
        let opts = FormatOptions::new(true, 100_000, 4096);
        let out = ContextFormatter::format(&[msg], &opts);
        let content = out[0]["content"].as_str().unwrap();
        assert!(content.starts_with("From: Alice"));
        assert!(content.ends_with("hello"));
    }

    #[test]
    fn reply_and_quote_and_forward_render_in_header() {
        let mut msg = base_message(MessageRole::User, "body text");
        msg.reply = Some(ReplyContext {
            snippet: "earlier msg".into(),
            sender_display: "Bob".into(),
        });
        msg.quote = Some(QuoteContext {
            text: "quoted bit".into(),
            position: Some(3),
            is_manual: true,
        });
        msg.forward = Some(ForwardOrigin {
            kind: ForwardOriginKind::User,
            display: "Carol".into(),
        });
        msg.edit_count = 2;

        let opts = FormatOptions::new(false, 100_000, 4096);
        let out = ContextFormatter::format(&[msg], &opts);
        let content = out[0]["content"].as_str().unwrap();
        assert!(content.contains("Forwarded from Carol"));
        assert!(content.contains("Replying to Bob: \"earlier msg\""));
        assert!(content.contains("Quote: \"quoted bit\""));
        assert!(content.contains("(edited 2x)"));
    }

    #[test]
    fn assistant_blob_is_returned_verbatim() {
        let mut msg = base_message(MessageRole::Assistant, "ignored");
        msg.content_blob = Some(serde_json::json!([
            {"type": "thinking", "thinking": "reasoning...", "signature": "sig-xyz"},
            {"type": "text", "text": "the answer"}
        ]));
        let opts = FormatOptions::new(false, 100_000, 4096);
        let out = ContextFormatter::format(&[msg.clone()], &opts);
        assert_eq!(out[0]["content"], msg.content_blob.unwrap());
    }

    #[test]
    fn empty_message_without_attachments_is_dropped() {
        let empty = base_message(MessageRole::User, "   ");
        let real = base_message(MessageRole::User, "real content");
        let opts = FormatOptions::new(false, 100_000, 4096);
        let out = ContextFormatter::format(&[empty, real], &opts);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["content"], serde_json::json!("real content"));
    }

    #[test]
    fn empty_text_with_attachment_is_kept() {
        let mut msg = base_message(MessageRole::User, "");
        msg.has_attachments = true;
        let opts = FormatOptions::new(false, 100_000, 4096);
        let out = ContextFormatter::format(&[msg], &opts);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn tail_fit_drops_oldest_when_over_budget() {
        let old = base_message(MessageRole::User, &"x".repeat(4000));
        let recent = base_message(MessageRole::User, &"y".repeat(4000));
        // Small window forces the formatter to keep only the most recent message.
        let opts = FormatOptions::new(false, 1_200, 100);
        let out = ContextFormatter::format(&[old, recent], &opts);
        assert_eq!(out.len(), 1);
        assert!(out[0]["content"]
            .as_str()
            .unwrap()
            .starts_with('y'));
    }

    #[test]
    fn tail_fit_always_keeps_at_least_the_latest_message() {
        let huge = base_message(MessageRole::User, &"z".repeat(100_000));
        let opts = FormatOptions::new(false, 100, 10);
        let out = ContextFormatter::format(&[huge], &opts);
        assert_eq!(out.len(), 1);
    }
}
