//! Core engine: trade intake, round settlement and progress queries,
//! tied together by [`GameService`].

pub mod intake;
pub mod market_id;
pub mod readiness;
pub mod settlement;

use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::{GameConfig, TradeLimits};
use crate::error::{GameError, Result};
use crate::storage::EntityStore;
use crate::types::{
    Market, MarketProgress, MarketUpdate, NewMarket, RoundStat, Trade, Trader, TraderStatus,
};
use market_id::{is_market_id, IdPolicy};
use settlement::RoundReport;

/// Runs the game against a store, serializing each market's settlement
/// against its intake.
///
/// Every market has a reader/writer lock. Intake writes hold it shared, so
/// traders submit concurrently; settlement and host edits hold it
/// exclusively. Queries never take it.
pub struct GameService<S: EntityStore + ?Sized = dyn EntityStore> {
    store: Arc<S>,
    locks: DashMap<String, Arc<RwLock<()>>>,
    config: GameConfig,
    limits: TradeLimits,
}

impl<S: EntityStore + ?Sized> GameService<S> {
    pub fn new(store: Arc<S>, config: GameConfig, limits: TradeLimits) -> Self {
        Self {
            store,
            locks: DashMap::new(),
            config,
            limits,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Lock for `market_id`. Malformed codes are rejected up front so they
    /// never get a lock table entry.
    fn market_lock(&self, market_id: &str) -> Result<Arc<RwLock<()>>> {
        if !is_market_id(market_id) {
            return Err(GameError::market_not_found(market_id));
        }
        Ok(self.locks.entry(market_id.to_string()).or_default().clone())
    }

    fn id_policy(&self) -> IdPolicy {
        IdPolicy {
            max_attempts: self.config.market_id_max_attempts,
        }
    }

    // -- Host actions -----------------------------------------------------

    pub async fn create_market(&self, new: NewMarket) -> Result<Market> {
        let mut rng = StdRng::from_entropy();
        intake::create_market(&*self.store, new, &self.id_policy(), &mut rng).await
    }

    pub async fn update_market(&self, market_id: &str, update: &MarketUpdate) -> Result<Market> {
        let lock = self.market_lock(market_id)?;
        let _guard = lock.write().await;
        intake::update_market(&*self.store, market_id, update).await
    }

    pub async fn delete_market(&self, market_id: &str) -> Result<()> {
        let lock = self.market_lock(market_id)?;
        let _guard = lock.write().await;
        self.store.delete_market(market_id).await?;
        self.locks.remove(market_id);
        info!(market_id, "Market deleted");
        Ok(())
    }

    pub async fn delete_trader(&self, trader_id: i64) -> Result<()> {
        let trader = self.store.get_trader(trader_id).await?;
        let lock = self.market_lock(&trader.market_id)?;
        let _guard = lock.write().await;
        self.store.delete_trader(trader_id).await?;
        info!(market_id = %trader.market_id, trader_id, "Trader deleted");
        Ok(())
    }

    /// Close the market's current round: create forced trades for traders
    /// who did not decide, then settle.
    ///
    /// With `expected_round` set, the call only proceeds if the market is
    /// still at that round, so a repeated host action cannot settle the
    /// next round by accident. The whole operation, lock wait included, is
    /// bounded by the configured settlement timeout; on expiry nothing has
    /// been committed.
    pub async fn advance_round(
        &self,
        market_id: &str,
        expected_round: Option<i64>,
    ) -> Result<RoundReport> {
        let timeout = self.config.settlement_timeout();
        let work = async {
            let lock = self.market_lock(market_id)?;
            let _guard = lock.write().await;

            let market = self.store.get_market(market_id).await?;
            if market.game_over {
                return Err(GameError::GameOver(format!("market {market_id} has ended")));
            }
            if let Some(expected) = expected_round {
                if expected != market.round {
                    return Err(GameError::AlreadySettled {
                        market_id: market_id.to_string(),
                        round: expected,
                    });
                }
            }

            intake::synthesize_forced_trades(&*self.store, &market).await?;
            settlement::settle_round(&*self.store, &market).await
        };

        match tokio::time::timeout(timeout, work).await {
            Ok(result) => result,
            Err(_) => {
                warn!(market_id, ?timeout, "Round advance timed out");
                Err(GameError::Timeout(timeout))
            }
        }
    }

    // -- Trader actions ---------------------------------------------------

    pub async fn join_market(
        &self,
        market_id: &str,
        name: &str,
        prod_cost: Option<Decimal>,
    ) -> Result<Trader> {
        let lock = self.market_lock(market_id)?;
        let _guard = lock.read().await;
        let mut rng = StdRng::from_entropy();
        intake::join_market(&*self.store, market_id, name, prod_cost, &mut rng).await
    }

    /// Submit a decision on behalf of a trader of `market_id`. A trader of a
    /// different market is reported as not found.
    pub async fn submit_trade(
        &self,
        market_id: &str,
        trader_id: i64,
        round: i64,
        unit_price: Decimal,
        unit_amount: i64,
    ) -> Result<Trade> {
        let trader = self.store.get_trader(trader_id).await?;
        if trader.market_id != market_id {
            return Err(GameError::trader_not_found(trader_id));
        }
        let lock = self.market_lock(market_id)?;
        let _guard = lock.read().await;
        intake::submit_trade(
            &*self.store,
            trader_id,
            round,
            unit_price,
            unit_amount,
            &self.limits,
        )
        .await
    }

    // -- Queries ----------------------------------------------------------

    pub async fn market(&self, market_id: &str) -> Result<Market> {
        self.store.get_market(market_id).await
    }

    pub async fn is_ready(&self, trader_id: i64) -> Result<bool> {
        readiness::is_ready(&*self.store, trader_id).await
    }

    pub async fn market_progress(&self, market_id: &str) -> Result<MarketProgress> {
        readiness::market_progress(&*self.store, market_id).await
    }

    pub async fn current_round(&self, market_id: &str) -> Result<i64> {
        readiness::current_round(&*self.store, market_id).await
    }

    pub async fn trader_table(&self, market_id: &str) -> Result<Vec<TraderStatus>> {
        readiness::trader_table(&*self.store, market_id).await
    }

    pub async fn traders_this_round(&self, market_id: &str) -> Result<Vec<String>> {
        readiness::traders_this_round(&*self.store, market_id).await
    }

    pub async fn round_history(&self, market_id: &str) -> Result<Vec<RoundStat>> {
        readiness::round_history(&*self.store, market_id).await
    }

    pub async fn markets_created_by(&self, owner: &str) -> Result<Vec<Market>> {
        readiness::markets_created_by(&*self.store, owner).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
