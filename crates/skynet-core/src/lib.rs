pub mod config;
pub mod error;
pub mod money;
pub mod reminder;
pub mod types;

/// Initialise the global `tracing` subscriber from `RUST_LOG` (or `info` if unset).
///
/// Every binary in this workspace calls this once at startup before touching
/// any other subsystem, so log output is consistent regardless of which
/// adapter (Telegram, tests, a future platform) is driving the core.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}
