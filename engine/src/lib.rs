//! artforge_engine - worker queues, model slots and event wiring
//!
//! This crate is what a host embeds: it owns one background worker per
//! long-running subsystem (diffusion, chat), keeps at most one model
//! resident per handler kind, and reports everything through the event bus.

pub mod state;
pub mod stream;
pub mod worker;

pub use state::{ChatCommand, DiffusionCommand, Engine};
pub use stream::token_stream;
pub use worker::Worker;

/// Install the tracing subscriber. `ARTFORGE_LOG` (then `RUST_LOG`) controls
/// the filter; defaults to `info`.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = std::env::var("ARTFORGE_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "info".to_string());

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(true)
        .try_init();
}
