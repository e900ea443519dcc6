pub mod bye;
pub mod cascade;
pub mod config;
pub mod engine;
pub mod error;
pub mod progression;
pub mod server;
pub mod store;
pub mod topology;
pub mod types;

pub use engine::BracketEngine;
pub use error::{EngineError, Result};
pub use store::{BracketStore, BracketTx, MemoryStore};

use config::{apply_env_defaults, load_config, load_env_file, ServerConfig};
use server::ServerState;
use std::{fs, path::PathBuf};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

// ── Entry point ────────────────────────────────────────────────────────

pub fn run() {
    load_env_file();
    let (config, config_error) = match load_config() {
        Ok(config) => (config, None),
        Err(e) => (apply_env_defaults(ServerConfig::default()), Some(e)),
    };

    let logs_dir = PathBuf::from(&config.log_dir);
    fs::create_dir_all(&logs_dir).ok();
    let file_appender = tracing_appender::rolling::daily(&logs_dir, "bracket.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(non_blocking)
        .with_ansi(false)
        .init();
    info!("Bracket server starting");
    if let Some(e) = config_error {
        warn!("{e}; falling back to defaults");
    }

    let state_path = config.state_path.as_ref().map(PathBuf::from);
    let store = match &state_path {
        Some(path) if path.is_file() => match MemoryStore::load_snapshot(path) {
            Ok(store) => {
                info!("restored brackets from {}", path.display());
                store
            }
            Err(e) => {
                // An unreadable snapshot must not be overwritten.
                error!("failed to load snapshot {}: {e}", path.display());
                return;
            }
        },
        _ => MemoryStore::new(),
    };

    let engine = BracketEngine::new(store, config.engine.clone());
    let state = ServerState::new(engine, state_path);
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to start async runtime: {e}");
            return;
        }
    };
    if let Err(e) = runtime.block_on(server::serve(state, &config.bind_addr)) {
        error!("bracket server failed on {}: {e}", config.bind_addr);
    }
}
