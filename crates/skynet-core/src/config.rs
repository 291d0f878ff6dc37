use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::money::Money;

/// Top-level config (skynet.toml + SKYNET_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkynetConfig {
    pub agent: AgentConfig,
    pub telegram: TelegramConfig,
    pub anthropic: AnthropicConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub pricing: PricingConfig,
    #[serde(default)]
    pub balance: BalanceConfig,
    #[serde(default)]
    pub stt: SttConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_model")]
    pub model: String,
    /// Path to the workspace directory the context formatter loads persona
    /// and memory files from (SOUL.md, IDENTITY.md, ...).
    pub soul_path: Option<String>,
    /// Context window budget, in tokens, the Context Formatter trims history to.
    #[serde(default = "default_context_window")]
    pub context_window_tokens: u32,
    /// Default extended-thinking level when a thread has no explicit override.
    #[serde(default)]
    pub default_thinking: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: String,
    /// Allowlist entries: usernames (with or without `@`), numeric user IDs,
    /// or `"*"` for everyone. Empty means deny-by-default.
    #[serde(default)]
    pub allow_users: Vec<String>,
    /// When true, group messages are only processed when the bot is @mentioned.
    #[serde(default = "bool_true")]
    pub require_mention: bool,
    /// When false, private DMs are ignored (group/channel-only deployment).
    #[serde(default = "bool_true")]
    pub dm_allowed: bool,
    /// Attachments larger than this are skipped rather than downloaded.
    #[serde(default = "default_max_attachment_bytes")]
    pub max_attachment_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicConfig {
    pub api_key: String,
    #[serde(default = "default_anthropic_base_url")]
    pub base_url: String,
    /// Files API base URL — defaults to the same host as the Messages API.
    #[serde(default = "default_anthropic_base_url")]
    pub files_base_url: String,
}

/// Voice transcription backend, used for Telegram voice/video-note messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttConfig {
    /// `"none"` (default), `"openai_whisper"`, or `"whisper_cpp"`.
    #[serde(default = "default_stt_provider")]
    pub provider: String,
    pub api_key: Option<String>,
    #[serde(default = "default_whisper_base_url")]
    pub base_url: String,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            provider: default_stt_provider(),
            api_key: None,
            base_url: default_whisper_base_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Tuning for the write-behind persistence queue (component A).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_backoff_base_secs")]
    pub retry_backoff_base_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: default_flush_interval_secs(),
            batch_size: default_batch_size(),
            max_attempts: default_max_attempts(),
            retry_backoff_base_secs: default_retry_backoff_base_secs(),
        }
    }
}

/// Per-model token pricing used by the Balance Gate's cost estimator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPricing {
    pub model: String,
    /// USD micro-units per input token.
    pub input_per_token: Money,
    /// USD micro-units per output token.
    pub output_per_token: Money,
    /// USD micro-units per prompt-cache-write token.
    #[serde(default)]
    pub cache_write_per_token: Money,
    /// USD micro-units per prompt-cache-read token.
    #[serde(default)]
    pub cache_read_per_token: Money,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PricingConfig {
    #[serde(default)]
    pub models: Vec<ModelPricing>,
    /// Flat per-invocation cost charged for a server-executed tool (e.g. web search).
    #[serde(default)]
    pub server_tool_cost: Money,
    /// USD micro-units charged per minute of audio sent to the STT backend.
    #[serde(default)]
    pub whisper_cost_per_minute: Money,
}

impl PricingConfig {
    /// Cost of one turn's token usage against the configured per-model rates.
    /// Unknown models charge nothing — missing pricing should never block a
    /// reply, only prevent it from being billed.
    pub fn estimate_turn_cost(&self, model: &str, tokens_in: u32, tokens_out: u32) -> Money {
        let Some(rate) = self.models.iter().find(|m| m.model == model) else {
            return Money::ZERO;
        };
        Money::from_micros(
            rate.input_per_token.micros() * tokens_in as i64
                + rate.output_per_token.micros() * tokens_out as i64,
        )
    }
}

/// Thresholds for the Balance Gate (component K).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceConfig {
    /// Minimum balance required to admit a new turn. Below this, the gate
    /// rejects before any provider call is made.
    #[serde(default)]
    pub floor: Money,
    /// Optional hard daily token quota layered on top of the balance floor,
    /// carried over from the per-user usage counters this core already tracks.
    pub daily_token_quota: Option<u64>,
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            floor: Money::ZERO,
            daily_token_quota: None,
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_model() -> String {
    "claude-sonnet-4-6".to_string()
}
fn default_context_window() -> u32 {
    180_000
}
fn default_anthropic_base_url() -> String {
    "https://api.anthropic.com".to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.skynet/skynet.db", home)
}
fn default_flush_interval_secs() -> u64 {
    5
}
fn default_batch_size() -> usize {
    100
}
fn default_max_attempts() -> u32 {
    3
}
fn default_retry_backoff_base_secs() -> u64 {
    2
}
fn default_stt_provider() -> String {
    "none".to_string()
}
fn default_whisper_base_url() -> String {
    "https://api.openai.com".to_string()
}
fn default_max_attachment_bytes() -> u64 {
    20 * 1024 * 1024
}

impl SkynetConfig {
    /// Load config from a TOML file with SKYNET_* env var overrides.
    ///
    /// Checks the explicit path argument first, falling back to
    /// `~/.skynet/skynet.toml`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: SkynetConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("SKYNET_").split("_"))
            .extract()
            .map_err(|e| crate::error::SkynetError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.skynet/skynet.toml", home)
}
