//! Shared fixtures: a classroom market, services over either store, and
//! helpers for driving whole rounds.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use market_game::config::{GameConfig, TradeLimits};
use market_game::engine::GameService;
use market_game::storage::memory::MemoryStore;
use market_game::storage::sqlite::SqliteStore;
use market_game::storage::EntityStore;
use market_game::types::{Market, NewMarket, Trader};

/// Baguettes: alpha 105, beta 17.5, theta 14.58, fixed cost 8, balance 5000.
pub fn baguette_market(max_rounds: i64) -> NewMarket {
    NewMarket {
        product_name_singular: "baguette".into(),
        product_name_plural: "baguettes".into(),
        alpha: dec!(105.0000),
        beta: dec!(17.5000),
        theta: dec!(14.5800),
        min_cost: dec!(8.00),
        max_cost: dec!(8.00),
        initial_balance: dec!(5000.00),
        max_rounds,
        endless: false,
        created_by: Some("host@example.org".into()),
    }
}

pub fn memory_service() -> Arc<GameService<MemoryStore>> {
    Arc::new(GameService::new(
        Arc::new(MemoryStore::new()),
        GameConfig::default(),
        TradeLimits::default(),
    ))
}

pub async fn sqlite_service() -> Arc<GameService<SqliteStore>> {
    let store = SqliteStore::in_memory().await.unwrap();
    Arc::new(GameService::new(
        Arc::new(store),
        GameConfig::default(),
        TradeLimits::default(),
    ))
}

/// A database file under the system temp dir, removed on drop along with
/// its WAL side files.
pub struct TempDb {
    pub path: PathBuf,
}

impl TempDb {
    pub fn new() -> Self {
        let path = std::env::temp_dir().join(format!("market-game-{}.db", Uuid::new_v4().simple()));
        Self { path }
    }

    pub fn url(&self) -> String {
        format!("sqlite://{}", self.path.display())
    }
}

impl Drop for TempDb {
    fn drop(&mut self) {
        for suffix in ["", "-wal", "-shm"] {
            let mut file = self.path.clone().into_os_string();
            file.push(suffix);
            let _ = std::fs::remove_file(file);
        }
    }
}

/// Service over a file-backed store with a multi-connection pool.
pub async fn file_sqlite_service(db: &TempDb) -> Arc<GameService<SqliteStore>> {
    let store = SqliteStore::connect(&db.url(), 5).await.unwrap();
    store.migrate().await.unwrap();
    Arc::new(GameService::new(
        Arc::new(store),
        GameConfig::default(),
        TradeLimits::default(),
    ))
}

/// Create a market and join `names` to it.
pub async fn market_with_traders<S>(
    game: &GameService<S>,
    new: NewMarket,
    names: &[&str],
) -> (Market, Vec<Trader>)
where
    S: EntityStore + ?Sized,
{
    let market = game.create_market(new).await.unwrap();
    let mut traders = Vec::new();
    for name in names {
        traders.push(game.join_market(&market.market_id, name, None).await.unwrap());
    }
    (market, traders)
}

/// Profit a trader should see for one decision, given the round's exact
/// average price. Mirrors the settlement rules for cross-checking.
pub fn expected_profit(
    market: &Market,
    prod_cost: Decimal,
    price: Decimal,
    amount: i64,
    avg_price: Decimal,
) -> Decimal {
    let demand = market.curve().demand(price, avg_price);
    let demand = demand
        .round_dp_with_strategy(0, rust_decimal::RoundingStrategy::MidpointAwayFromZero);
    let units = demand.min(Decimal::from(amount));
    (price * units - prod_cost * Decimal::from(amount))
        .round_dp_with_strategy(2, rust_decimal::RoundingStrategy::MidpointAwayFromZero)
}
