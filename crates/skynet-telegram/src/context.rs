//! Context interface the Telegram handler needs from the host process.
//!
//! Deliberately narrow: everything the streaming orchestrator touches
//! (provider, tools, thread/file stores, balance gate, platform client) and
//! nothing else. This replaces the old `skynet_agent::pipeline::MessageContext`
//! re-export — that trait (and the gateway/terminal/scheduler machinery behind
//! it) has no counterpart in this system; see `DESIGN.md`.

use std::sync::{Arc, Mutex as StdMutex};

use rusqlite::Connection;
use skynet_agent::batch::BatchCoordinator;
use skynet_agent::runtime::AgentRuntime;
use skynet_agent::tools::Tool;
use skynet_agent::BlobCache;
use skynet_core::config::{BalanceConfig, PricingConfig};
use skynet_memory::{FileStore, ThreadCache};
use skynet_queue::QueueStore;
use skynet_users::UserResolver;

use crate::handler::RunTurnRequest;
use crate::platform::TelegramPlatformClient;

/// Shared state every Telegram message handler reads from.
pub trait TelegramAppContext: Send + Sync {
    fn agent(&self) -> &AgentRuntime;
    fn threads(&self) -> &Arc<ThreadCache>;
    fn files(&self) -> &Arc<FileStore>;
    fn users(&self) -> &UserResolver;
    /// Connection the balance ledger lives on — `BalanceGate`'s methods are
    /// free functions over `&Connection`, not an owned service.
    fn users_db(&self) -> &Arc<StdMutex<Connection>>;
    fn balance(&self) -> &BalanceConfig;
    fn pricing(&self) -> &PricingConfig;
    fn platform(&self) -> &TelegramPlatformClient;
    fn blob_cache(&self) -> &Arc<BlobCache>;
    /// Client-side tools exposed to the LLM. Server tools (web search, etc.)
    /// are declared in `ChatRequest.tools` directly by the caller, not here.
    fn tools(&self) -> &[Box<dyn Tool>];
    fn context_window_tokens(&self) -> u32;
    fn default_model(&self) -> &str;
    /// Write-behind queue every durable turn/stats/balance/file/tool-call
    /// write is routed through instead of a synchronous insert.
    fn queue(&self) -> &Arc<QueueStore>;
    /// Per-thread debounce in front of the orchestrator, coalescing rapid
    /// message bursts into a single turn.
    fn batch(&self) -> &Arc<BatchCoordinator<RunTurnRequest>>;
}
