use serde::{Deserialize, Serialize};
use skynet_core::money::Money;

/// What kind of memory this is. Priority order for prompt injection:
/// instruction > preference > fact > context (higher = included first).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryCategory {
    Instruction,
    Preference,
    Fact,
    Context,
}

impl std::fmt::Display for MemoryCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Instruction => write!(f, "instruction"),
            Self::Preference => write!(f, "preference"),
            Self::Fact => write!(f, "fact"),
            Self::Context => write!(f, "context"),
        }
    }
}

impl std::str::FromStr for MemoryCategory {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "instruction" => Ok(Self::Instruction),
            "preference" => Ok(Self::Preference),
            "fact" => Ok(Self::Fact),
            "context" => Ok(Self::Context),
            other => Err(format!("unknown memory category: {other}")),
        }
    }
}

/// How the memory was acquired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemorySource {
    /// User explicitly stated this ("I'm vegetarian").
    UserSaid,
    /// AI inferred from conversation context.
    Inferred,
    /// Admin set this on behalf of the user.
    AdminSet,
}

impl std::fmt::Display for MemorySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UserSaid => write!(f, "user_said"),
            Self::Inferred => write!(f, "inferred"),
            Self::AdminSet => write!(f, "admin_set"),
        }
    }
}

impl std::str::FromStr for MemorySource {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user_said" => Ok(Self::UserSaid),
            "inferred" => Ok(Self::Inferred),
            "admin_set" => Ok(Self::AdminSet),
            other => Err(format!("unknown memory source: {other}")),
        }
    }
}

/// Single memory entry for a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserMemory {
    pub id: i64,
    pub user_id: String,
    pub category: MemoryCategory,
    pub key: String,
    pub value: String,
    /// 0.0–1.0 confidence score. Higher confidence wins on UPSERT.
    pub confidence: f64,
    pub source: MemorySource,
    pub expires_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// A knowledge base entry — operator or bot-authored fact stored with FTS5 index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub id: i64,
    pub topic: String,
    pub content: String,
    /// Comma-separated tags for loose categorisation (e.g. "ai,models,anthropic").
    pub tags: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Rendered user context ready for prompt injection.
/// Capped at ~1500 tokens. Priority: instruction > preference > fact > context.
#[derive(Debug, Clone)]
pub struct UserContext {
    pub user_id: String,
    pub rendered: String,
    pub memory_count: usize,
    pub built_at: chrono::DateTime<chrono::Utc>,
}

/// Identifies one Thread: a chat, the user driving it, and an optional
/// sub-topic. Threads are the unit of LLM context — a Chat may host several
/// Threads (one per forum topic, or one per user in a group).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ThreadKey {
    pub chat_id: String,
    pub user_id: String,
    pub topic: Option<String>,
}

impl ThreadKey {
    pub fn new(chat_id: impl Into<String>, user_id: impl Into<String>, topic: Option<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            user_id: user_id.into(),
            topic,
        }
    }

    /// Canonical string form, e.g. `"chat:123:user:456:topic:7"` or
    /// `"chat:123:user:456"` when there is no sub-topic.
    pub fn format(&self) -> String {
        match &self.topic {
            Some(t) => format!("chat:{}:user:{}:topic:{}", self.chat_id, self.user_id, t),
            None => format!("chat:{}:user:{}", self.chat_id, self.user_id),
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        let rest = s
            .strip_prefix("chat:")
            .ok_or_else(|| format!("thread key missing chat: prefix: {s}"))?;
        let (chat_id, rest) = rest
            .split_once(":user:")
            .ok_or_else(|| format!("thread key missing :user: marker: {s}"))?;
        match rest.split_once(":topic:") {
            Some((user_id, topic)) => Ok(Self {
                chat_id: chat_id.to_string(),
                user_id: user_id.to_string(),
                topic: Some(topic.to_string()),
            }),
            None => Ok(Self {
                chat_id: chat_id.to_string(),
                user_id: rest.to_string(),
                topic: None,
            }),
        }
    }
}

impl std::fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.format())
    }
}

/// One logical conversation: a chat, a user, an optional sub-topic, plus the
/// running counters the Balance Gate and Context Formatter consult.
///
/// Destruction is logical: `deleted_at` is set, the row is never removed, so
/// a re-opened chat with the same key resumes rather than re-creating state.
#[derive(Debug, Clone)]
pub struct Thread {
    pub id: i64,
    pub key: ThreadKey,
    pub title: Option<String>,
    pub message_count: u32,
    pub total_tokens: u64,
    pub last_model: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub deleted_at: Option<String>,
}

impl Thread {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::System => write!(f, "system"),
        }
    }
}

impl std::str::FromStr for MessageRole {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            other => Err(format!("unknown message role: {other}")),
        }
    }
}

/// Origin of a forwarded message, orthogonal to reply/quote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardOriginKind {
    User,
    Chat,
    Channel,
    Hidden,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyContext {
    /// First 200 characters of the replied-to message body.
    pub snippet: String,
    pub sender_display: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardOrigin {
    pub kind: ForwardOriginKind,
    pub display: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteContext {
    pub text: String,
    pub position: Option<u32>,
    pub is_manual: bool,
}

/// One turn in a Thread. Composite key is `(chat_id, platform_message_id)`.
///
/// `content_blob`, when present, is the verbatim content-block array the LLM
/// emitted for an assistant turn (thinking, redacted-thinking, tool_use,
/// text, image blocks). It is stored and replayed byte-identical — thinking
/// block signatures are cryptographically bound to their content, so
/// rebuilding this array from `text` plus a separate thinking field is a bug
/// the Context Formatter must never commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub chat_id: String,
    pub platform_message_id: i64,
    pub thread_id: i64,
    pub role: MessageRole,
    pub text: String,
    pub content_blob: Option<serde_json::Value>,
    pub sender_display: Option<String>,
    pub reply: Option<ReplyContext>,
    pub forward: Option<ForwardOrigin>,
    pub quote: Option<QuoteContext>,
    pub has_attachments: bool,
    pub edit_count: u32,
    pub original_text: Option<String>,
    pub model_used: Option<String>,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub cost: Money,
    pub created_at: String,
}

/// Shape used when inserting a new message — `id` and the edit-tracking
/// fields are assigned by the store. Also carried as a queued write
/// envelope payload, hence the serde derives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub chat_id: String,
    pub platform_message_id: i64,
    pub thread_id: i64,
    pub role: MessageRole,
    pub text: String,
    pub content_blob: Option<serde_json::Value>,
    pub sender_display: Option<String>,
    pub reply: Option<ReplyContext>,
    pub forward: Option<ForwardOrigin>,
    pub quote: Option<QuoteContext>,
    pub has_attachments: bool,
    pub model_used: Option<String>,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub cost: Money,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Image,
    Audio,
    Video,
    Pdf,
    Document,
}

impl std::fmt::Display for FileKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Image => write!(f, "image"),
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
            Self::Pdf => write!(f, "pdf"),
            Self::Document => write!(f, "document"),
        }
    }
}

impl std::str::FromStr for FileKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image" => Ok(Self::Image),
            "audio" => Ok(Self::Audio),
            "video" => Ok(Self::Video),
            "pdf" => Ok(Self::Pdf),
            "document" => Ok(Self::Document),
            other => Err(format!("unknown file kind: {other}")),
        }
    }
}

/// A binding between a platform file handle, an LLM-files-API handle, and an
/// expiry. Created at normalization time, or when a tool emits a generated
/// file; referenced by the message that introduced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadedFile {
    pub id: i64,
    pub platform_file_id: String,
    pub llm_file_id: Option<String>,
    pub mime_type: String,
    pub kind: FileKind,
    pub message_id: Option<i64>,
    pub expires_at: String,
    pub created_at: String,
}

impl UploadedFile {
    pub fn is_expired(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        match chrono::DateTime::parse_from_rfc3339(&self.expires_at) {
            Ok(exp) => exp < now,
            Err(_) => false,
        }
    }
}
