//! Process-local wiring for the Telegram bot binary.
//!
//! Assembles every store, client, and runtime the handler needs behind a
//! single `TelegramAppState`, then implements `TelegramAppContext` over it.
//! Mirrors the shape of the old gateway `AppState`, minus everything that
//! only the HTTP/WS surface needed.

use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use rusqlite::Connection;
use teloxide::prelude::*;
use tokio::sync::{mpsc, watch};

use skynet_agent::anthropic::AnthropicProvider;
use skynet_agent::batch::BatchCoordinator;
use skynet_agent::prompt::PromptBuilder;
use skynet_agent::runtime::AgentRuntime;
use skynet_agent::toolcall::{ToolCallConsumer, ToolCallLog};
use skynet_agent::{BlobCache, FilesClient};
use skynet_core::config::{BalanceConfig, PricingConfig, SkynetConfig};
use skynet_memory::{FileConsumer, FileStore, MessageConsumer, ThreadCache};
use skynet_queue::{EnvelopeKind, Flusher, QueueStore};
use skynet_users::{BalanceReceiptConsumer, UserResolver, UserStatsConsumer};

use crate::context::TelegramAppContext;
use crate::handler::RunTurnRequest;
use crate::platform::TelegramPlatformClient;
use crate::stt::TranscriptionBackend;
use crate::tools;
use skynet_agent::tools::Tool;

/// Shared state for the Telegram bot process.
pub struct TelegramAppState {
    agent: AgentRuntime,
    threads: Arc<ThreadCache>,
    files: Arc<FileStore>,
    users: UserResolver,
    users_db: Arc<StdMutex<Connection>>,
    balance: BalanceConfig,
    pricing: PricingConfig,
    platform: TelegramPlatformClient,
    blob_cache: Arc<BlobCache>,
    tools: Vec<Box<dyn Tool>>,
    context_window_tokens: u32,
    default_model: String,
    queue: Arc<QueueStore>,
    batch: Arc<BatchCoordinator<RunTurnRequest>>,
}

impl TelegramAppState {
    /// Open the database, build every dependent store, and wire up the
    /// Anthropic provider. Each store that owns its connection outright
    /// (`ThreadCache`, `FileStore`, `QueueStore`) gets its own handle onto
    /// the same database file; the balance ledger and user resolver share
    /// one connection behind a mutex since `BalanceGate` operates directly
    /// on `&Connection`.
    ///
    /// Returns the state itself plus the write-behind `Flusher` (with every
    /// consumer already registered) and the batch coordinator's receiver —
    /// both need a background task driving them, which only the caller
    /// (main) can spawn once the state is wrapped in an `Arc`.
    pub fn new(
        config: &SkynetConfig,
        bot: Bot,
        tools_dir: &Path,
    ) -> anyhow::Result<(Self, Flusher, mpsc::UnboundedReceiver<(String, Vec<RunTurnRequest>)>)> {
        let users_conn = Connection::open(&config.database.path)?;
        skynet_users::db::init_db(&users_conn)?;
        let users_db = Arc::new(StdMutex::new(users_conn));

        let threads_conn = Connection::open(&config.database.path)?;
        skynet_memory::db::init_db(&threads_conn)?;
        let threads = Arc::new(ThreadCache::new(threads_conn));

        let files_conn = Connection::open(&config.database.path)?;
        skynet_memory::db::init_db(&files_conn)?;
        let files = Arc::new(FileStore::new(files_conn));

        let tool_calls_conn = Connection::open(&config.database.path)?;
        skynet_agent::toolcall::init_db(&tool_calls_conn)?;
        let tool_call_log = Arc::new(ToolCallLog::new(Arc::new(StdMutex::new(tool_calls_conn))));

        let queue_conn = Connection::open(&config.database.path)?;
        let queue = Arc::new(QueueStore::new(queue_conn)?);

        let mut flusher = Flusher::new(
            queue.clone(),
            config.queue.batch_size,
            config.queue.max_attempts,
            config.queue.retry_backoff_base_secs,
        );
        flusher.register(EnvelopeKind::Message, Arc::new(MessageConsumer::new(threads.clone())));
        flusher.register(EnvelopeKind::File, Arc::new(FileConsumer::new(files.clone())));
        flusher.register(EnvelopeKind::UserStats, Arc::new(UserStatsConsumer::new(users_db.clone())));
        flusher.register(
            EnvelopeKind::BalanceOp,
            Arc::new(BalanceReceiptConsumer::new(users_db.clone())),
        );
        flusher.register(EnvelopeKind::ToolCall, Arc::new(ToolCallConsumer::new(tool_call_log)));

        let (batch, batch_rx) = BatchCoordinator::with_default_debounce();

        let users = UserResolver::new(users_db.clone());

        let provider = AnthropicProvider::new(
            config.anthropic.api_key.clone(),
            Some(config.anthropic.base_url.clone()),
        );
        let prompt = PromptBuilder::load(config.agent.soul_path.as_deref(), None);
        let agent = AgentRuntime::new(Box::new(provider), prompt, config.agent.model.clone());

        let files_client = FilesClient::new(
            config.anthropic.api_key.clone(),
            config.anthropic.files_base_url.clone(),
        );
        let blob_cache = Arc::new(BlobCache::new());
        let stt_backend = TranscriptionBackend::from_config(&config.stt);
        let platform = TelegramPlatformClient::new(
            bot,
            files_client,
            blob_cache.clone(),
            stt_backend,
            config.pricing.clone(),
        );

        let state = Self {
            agent,
            threads,
            files,
            users,
            users_db,
            balance: config.balance.clone(),
            pricing: config.pricing.clone(),
            platform,
            blob_cache,
            tools: tools::build_tools(tools_dir),
            context_window_tokens: config.agent.context_window_tokens,
            default_model: config.agent.model.clone(),
            queue,
            batch,
        };

        Ok((state, flusher, batch_rx))
    }

    /// Spawn the write-behind flusher's poll loop, returning the shutdown
    /// sender the caller holds to drain the queue before the process exits.
    pub fn spawn_flusher(config: &SkynetConfig, flusher: Flusher) -> watch::Sender<bool> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let interval = Duration::from_secs(config.queue.flush_interval_secs);
        tokio::spawn(flusher.run(interval, shutdown_rx));
        shutdown_tx
    }
}

impl TelegramAppContext for TelegramAppState {
    fn agent(&self) -> &AgentRuntime {
        &self.agent
    }

    fn threads(&self) -> &Arc<ThreadCache> {
        &self.threads
    }

    fn files(&self) -> &Arc<FileStore> {
        &self.files
    }

    fn users(&self) -> &UserResolver {
        &self.users
    }

    fn users_db(&self) -> &Arc<StdMutex<Connection>> {
        &self.users_db
    }

    fn balance(&self) -> &BalanceConfig {
        &self.balance
    }

    fn pricing(&self) -> &PricingConfig {
        &self.pricing
    }

    fn platform(&self) -> &TelegramPlatformClient {
        &self.platform
    }

    fn blob_cache(&self) -> &Arc<BlobCache> {
        &self.blob_cache
    }

    fn tools(&self) -> &[Box<dyn Tool>] {
        &self.tools
    }

    fn context_window_tokens(&self) -> u32 {
        self.context_window_tokens
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    fn queue(&self) -> &Arc<QueueStore> {
        &self.queue
    }

    fn batch(&self) -> &Arc<BatchCoordinator<RunTurnRequest>> {
        &self.batch
    }
}
