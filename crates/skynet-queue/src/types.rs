use serde::{Deserialize, Serialize};

/// The kind of durable write an envelope carries.
///
/// Mirrors the write types a legacy Redis-backed queue this design replaces
/// used to tag entries with, so the flush-dispatch groups writes by table the
/// same way: a batch of `Message` envelopes becomes one multi-row insert,
/// not N single-row inserts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Message,
    UserStats,
    BalanceOp,
    File,
    ToolCall,
}

impl EnvelopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeKind::Message => "message",
            EnvelopeKind::UserStats => "user_stats",
            EnvelopeKind::BalanceOp => "balance_op",
            EnvelopeKind::File => "file",
            EnvelopeKind::ToolCall => "tool_call",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "message" => Some(EnvelopeKind::Message),
            "user_stats" => Some(EnvelopeKind::UserStats),
            "balance_op" => Some(EnvelopeKind::BalanceOp),
            "file" => Some(EnvelopeKind::File),
            "tool_call" => Some(EnvelopeKind::ToolCall),
            _ => None,
        }
    }
}

/// One durable entry in the write-behind queue.
///
/// `payload` is an opaque JSON blob; the consumer registered for `kind`
/// decides how to deserialize and apply it. This keeps the queue itself
/// free of any dependency on the higher-level `Message`/`BalanceOperation`
/// types it carries — those live in the crates that enqueue and consume them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteEnvelope {
    pub id: i64,
    pub kind: EnvelopeKind,
    pub payload: serde_json::Value,
    pub enqueued_at: String,
    pub attempts: u32,
    /// RFC3339 timestamp; the envelope is not popped for processing before this.
    pub retry_after: Option<String>,
}
