//! Configuration loading from TOML.
//!
//! Reads `config.toml` (or the path in `MARKET_GAME_CONFIG`) and
//! deserializes into strongly-typed structs. Every section has defaults,
//! so a partial file is fine.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::fs;
use std::time::Duration;

/// Environment variable that overrides the config file path.
pub const CONFIG_PATH_ENV: &str = "MARKET_GAME_CONFIG";

/// Default config file path.
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub game: GameConfig,
    #[serde(default)]
    pub limits: TradeLimits,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    /// sqlx SQLite URL, e.g. `sqlite://market_game.db`.
    pub database_url: String,
    pub max_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://market_game.db".into(),
            max_connections: 5,
        }
    }
}

/// Engine-level knobs.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GameConfig {
    /// Collisions tolerated before market creation gives up.
    pub market_id_max_attempts: u32,
    /// Upper bound on one host "advance round" action.
    pub settlement_timeout_secs: u64,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            market_id_max_attempts: 1000,
            settlement_timeout_secs: 30,
        }
    }
}

impl GameConfig {
    pub fn settlement_timeout(&self) -> Duration {
        Duration::from_secs(self.settlement_timeout_secs)
    }
}

/// Input ranges accepted by trade intake.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TradeLimits {
    pub max_unit_price: Decimal,
    pub max_unit_amount: i64,
}

impl Default for TradeLimits {
    fn default() -> Self {
        Self {
            max_unit_price: dec!(9999999999.99),
            max_unit_amount: 2_147_483_647,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::parse(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    /// Parse configuration from TOML text.
    pub fn parse(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        Ok(config)
    }

    /// The config path to use: `MARKET_GAME_CONFIG` if set, else `config.toml`.
    pub fn default_path() -> String {
        std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string())
    }
}
