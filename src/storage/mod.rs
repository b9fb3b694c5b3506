//! Persistence layer.
//!
//! Defines the `EntityStore` trait the engine talks to, and provides two
//! implementations:
//! - `MemoryStore`: in-process tables, used by tests and embedded games
//! - `SqliteStore`: sqlx/SQLite, used by the server binary
//!
//! Both reject duplicate keys with [`GameError::Uniqueness`] and apply a
//! round's settlement as a single all-or-nothing commit.
//!
//! [`GameError::Uniqueness`]: crate::error::GameError::Uniqueness

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{
    Market, NewTrade, NewTrader, RoundStat, SettlementBatch, Trade, TradeOutcome, Trader,
};

/// Abstraction over the game's record storage.
///
/// Only `commit_settlement` may change a market's round or a trader's
/// balance. Everything else is plain CRUD.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EntityStore: Send + Sync {
    // -- Markets ----------------------------------------------------------

    /// Insert a new market. Fails with `Uniqueness` if the id is taken.
    async fn insert_market(&self, market: &Market) -> Result<()>;

    async fn market_exists(&self, market_id: &str) -> Result<bool>;

    async fn get_market(&self, market_id: &str) -> Result<Market>;

    /// Overwrite a market's host-editable settings. Round and game-over
    /// state are left as stored.
    async fn update_market_settings(&self, market: &Market) -> Result<()>;

    async fn markets_created_by(&self, owner: &str) -> Result<Vec<Market>>;

    /// Delete a market with its traders, trades and round stats.
    async fn delete_market(&self, market_id: &str) -> Result<()>;

    // -- Traders ----------------------------------------------------------

    /// Insert a trader. Fails with `Uniqueness` on a duplicate name within
    /// the market and `NotFound` when the market does not exist.
    async fn insert_trader(&self, trader: &NewTrader) -> Result<Trader>;

    async fn get_trader(&self, trader_id: i64) -> Result<Trader>;

    /// All traders of a market, ordered by id.
    async fn traders_in_market(&self, market_id: &str) -> Result<Vec<Trader>>;

    /// Delete a trader with its trades.
    async fn delete_trader(&self, trader_id: i64) -> Result<()>;

    // -- Trades -----------------------------------------------------------

    /// Insert one trade. Fails with `Uniqueness` if the trader already has a
    /// trade for that round; the existing row is untouched.
    async fn insert_trade(&self, trade: &NewTrade) -> Result<Trade>;

    /// Insert several trades atomically: either all rows land or none do.
    async fn insert_trades(&self, trades: &[NewTrade]) -> Result<Vec<Trade>>;

    async fn get_trade(&self, trade_id: i64) -> Result<Trade>;

    /// Trades of one trader for one round (normally zero or one).
    async fn trades_for_trader(&self, trader_id: i64, round: i64) -> Result<Vec<Trade>>;

    /// Trades of every trader in a market for one round, ordered by id.
    async fn trades_for_round(&self, market_id: &str, round: i64) -> Result<Vec<Trade>>;

    /// Write the outcome fields of an existing trade.
    async fn update_trade_outcome(&self, outcome: &TradeOutcome) -> Result<Trade>;

    // -- Round stats ------------------------------------------------------

    async fn round_stat(&self, market_id: &str, round: i64) -> Result<Option<RoundStat>>;

    /// Round history of a market, ordered by round.
    async fn round_stats(&self, market_id: &str) -> Result<Vec<RoundStat>>;

    // -- Settlement -------------------------------------------------------

    /// Apply a settled round in one transaction: trade outcomes, trader
    /// balances, the round stat, and the market's round advance.
    ///
    /// Fails with `AlreadySettled` when the market has moved past
    /// `batch.round` or a stat for that round exists. Any failure leaves
    /// every row as it was.
    async fn commit_settlement(&self, batch: &SettlementBatch) -> Result<RoundStat>;
}
