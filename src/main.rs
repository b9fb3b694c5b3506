//! Market game server.
//!
//! Entry point. Loads configuration, initialises structured logging,
//! opens the SQLite store, and serves the HTTP API until Ctrl-C.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

use market_game::api;
use market_game::config::AppConfig;
use market_game::engine::GameService;
use market_game::storage::sqlite::SqliteStore;
use market_game::storage::EntityStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let config_path = AppConfig::default_path();
    let cfg = if std::path::Path::new(&config_path).exists() {
        AppConfig::load(&config_path)?
    } else {
        AppConfig::default()
    };

    init_logging();

    if !std::path::Path::new(&config_path).exists() {
        warn!(path = %config_path, "Config file not found, using defaults");
    }
    info!(
        database_url = %cfg.storage.database_url,
        port = cfg.server.port,
        settlement_timeout_secs = cfg.game.settlement_timeout_secs,
        "Market game starting up"
    );

    let store = SqliteStore::connect(&cfg.storage.database_url, cfg.storage.max_connections)
        .await
        .with_context(|| format!("Failed to open database {}", cfg.storage.database_url))?;
    store.migrate().await.context("Failed to apply schema")?;

    let store: Arc<dyn EntityStore> = Arc::new(store);
    let service = Arc::new(GameService::new(store, cfg.game.clone(), cfg.limits.clone()));

    let addr: SocketAddr = format!("{}:{}", cfg.server.host, cfg.server.port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", cfg.server.host, cfg.server.port))?;

    api::serve(service, addr, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown signal received");
    })
    .await?;

    info!("Market game shut down cleanly");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("market_game=info"));

    let json_logging = std::env::var("MARKET_GAME_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
