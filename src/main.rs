//! Entrypoint: load configuration, set up tracing, restore the log index from
//! its snapshot (or start empty), serve it over HTTP, and write the snapshot
//! back on shutdown.
//!
//! Configuration comes from `Config.toml` plus `APP__…` overrides (see
//! `config.rs`); the `[server]` section provides:
//!  - `bind`        – HTTP bind address for ingestion, search, metrics & health
//!  - `prefix`      – route prefix for the index endpoints
//!  - `schema`      – indexed fields and their kinds
//!  - `snapshot`    – snapshot file path and format (`json` | `binary`)

use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use rust_log_indexer::config::Settings;
use rust_log_indexer::errors::IndexerError;
use rust_log_indexer::server;

#[tokio::main]
async fn main() -> Result<(), IndexerError> {
    // ───────────────────────────────────────────────────────────────
    // 1. Load configuration
    // ───────────────────────────────────────────────────────────────
    let settings = Settings::new()?;

    // ───────────────────────────────────────────────────────────────
    // 2. Initialise tracing / logging (`RUST_LOG` wins over the config)
    // ───────────────────────────────────────────────────────────────
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.server.log_level));
    fmt().with_env_filter(filter).init();
    info!(?settings, "Loaded configuration");

    // ───────────────────────────────────────────────────────────────
    // 3. Serve until Ctrl-C / SIGTERM, then persist
    // ───────────────────────────────────────────────────────────────
    server::run(settings.server).await
}
