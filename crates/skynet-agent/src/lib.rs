pub mod anthropic;
pub mod anthropic_stream;
pub mod batch;
pub mod bedrock;
pub mod blob_cache;
pub mod chat_action;
pub mod claude_cli;
pub mod context;
pub mod copilot;
pub mod files;
pub mod health;
pub mod normalize;
pub mod ollama;
pub mod openai;
pub mod orchestrator;
pub mod prompt;
pub mod provider;
pub mod qwen_oauth;
pub mod registry;
pub mod router;
pub mod runtime;
pub mod session;
pub mod stream;
pub mod thinking;
pub mod toolcall;
pub mod tools;
pub mod vertex;

pub use blob_cache::BlobCache;
pub use context::{ContextFormatter, FormatOptions};
pub use files::FilesClient;
pub use orchestrator::{DraftHandle, Orchestrator, StreamResult};
pub use provider::{ChatRequest, ChatResponse, LlmProvider, ProviderError, StopReason};
pub use runtime::AgentRuntime;
pub use session::{DisplayBlock, PendingTool, StreamingSession};
pub use stream::StreamEvent;
pub use thinking::ThinkingLevel;
pub use toolcall::{QueuedToolCall, ToolCallConsumer, ToolCallLog};
