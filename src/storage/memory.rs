//! In-memory entity store.
//!
//! Tables live behind one `RwLock`. Multi-row writes are applied to a staged
//! copy and swapped in only when every step succeeds, so a failure part-way
//! leaves nothing behind.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Mutex;
use tokio::sync::RwLock;
use tracing::debug;

use super::EntityStore;
use crate::error::{GameError, Result};
use crate::types::{
    Market, NewTrade, NewTrader, RoundStat, SettlementBatch, Trade, TradeOutcome, Trader,
};

#[derive(Debug, Clone, Default)]
struct Tables {
    markets: BTreeMap<String, Market>,
    traders: BTreeMap<i64, Trader>,
    trades: BTreeMap<i64, Trade>,
    round_stats: BTreeMap<(String, i64), RoundStat>,
    next_trader_id: i64,
    next_trade_id: i64,
}

impl Tables {
    fn market(&self, market_id: &str) -> Result<&Market> {
        self.markets
            .get(market_id)
            .ok_or_else(|| GameError::market_not_found(market_id))
    }

    fn trader(&self, trader_id: i64) -> Result<&Trader> {
        self.traders
            .get(&trader_id)
            .ok_or_else(|| GameError::trader_not_found(trader_id))
    }

    fn insert_trade(&mut self, new: &NewTrade) -> Result<Trade> {
        self.trader(new.trader_id)?;
        let duplicate = self
            .trades
            .values()
            .any(|t| t.trader_id == new.trader_id && t.round == new.round);
        if duplicate {
            return Err(GameError::Uniqueness(format!(
                "trader {} already has a trade for round {}",
                new.trader_id, new.round
            )));
        }

        self.next_trade_id += 1;
        let trade = Trade {
            id: self.next_trade_id,
            trader_id: new.trader_id,
            round: new.round,
            unit_price: new.unit_price,
            unit_amount: new.unit_amount,
            was_forced: new.was_forced,
            demand: None,
            units_sold: None,
            profit: None,
            balance_after: None,
            created_at: Utc::now(),
        };
        self.trades.insert(trade.id, trade.clone());
        Ok(trade)
    }

    fn write_outcome(&mut self, outcome: &TradeOutcome) -> Result<Trade> {
        let trade = self
            .trades
            .get_mut(&outcome.trade_id)
            .ok_or_else(|| GameError::trade_not_found(outcome.trade_id))?;
        if trade.trader_id != outcome.trader_id {
            return Err(GameError::Consistency(format!(
                "trade {} belongs to trader {}, not {}",
                trade.id, trade.trader_id, outcome.trader_id
            )));
        }
        trade.demand = Some(outcome.demand);
        trade.units_sold = Some(outcome.units_sold);
        trade.profit = Some(outcome.profit);
        trade.balance_after = Some(outcome.balance_after);
        Ok(trade.clone())
    }

    fn remove_trader(&mut self, trader_id: i64) {
        self.traders.remove(&trader_id);
        self.trades.retain(|_, t| t.trader_id != trader_id);
    }
}

/// Entity store backed by in-process maps.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    /// When set, the next settlement commit fails after this many trade
    /// writes. Lets tests prove commits are all-or-nothing.
    fail_settlement_after: Mutex<Option<usize>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `commit_settlement` fail after `writes` trade updates.
    pub fn fail_settlement_after(&self, writes: usize) {
        if let Ok(mut slot) = self.fail_settlement_after.lock() {
            *slot = Some(writes);
        }
    }

    fn take_injected_failure(&self) -> Option<usize> {
        self.fail_settlement_after
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn insert_market(&self, market: &Market) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.markets.contains_key(&market.market_id) {
            return Err(GameError::Uniqueness(format!(
                "market id {} already exists",
                market.market_id
            )));
        }
        tables.markets.insert(market.market_id.clone(), market.clone());
        Ok(())
    }

    async fn market_exists(&self, market_id: &str) -> Result<bool> {
        Ok(self.tables.read().await.markets.contains_key(market_id))
    }

    async fn get_market(&self, market_id: &str) -> Result<Market> {
        self.tables.read().await.market(market_id).cloned()
    }

    async fn update_market_settings(&self, market: &Market) -> Result<()> {
        let mut tables = self.tables.write().await;
        let stored = tables
            .markets
            .get_mut(&market.market_id)
            .ok_or_else(|| GameError::market_not_found(&market.market_id))?;
        let round = stored.round;
        let game_over = stored.game_over;
        *stored = market.clone();
        stored.round = round;
        stored.game_over = game_over;
        Ok(())
    }

    async fn markets_created_by(&self, owner: &str) -> Result<Vec<Market>> {
        let tables = self.tables.read().await;
        let mut markets: Vec<Market> = tables
            .markets
            .values()
            .filter(|m| m.created_by.as_deref() == Some(owner))
            .cloned()
            .collect();
        markets.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(markets)
    }

    async fn delete_market(&self, market_id: &str) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.market(market_id)?;
        let trader_ids: Vec<i64> = tables
            .traders
            .values()
            .filter(|t| t.market_id == market_id)
            .map(|t| t.id)
            .collect();
        for id in trader_ids {
            tables.remove_trader(id);
        }
        tables.round_stats.retain(|(m, _), _| m != market_id);
        tables.markets.remove(market_id);
        debug!(market_id, "Market deleted");
        Ok(())
    }

    async fn insert_trader(&self, new: &NewTrader) -> Result<Trader> {
        let mut tables = self.tables.write().await;
        tables.market(&new.market_id)?;
        let duplicate = tables
            .traders
            .values()
            .any(|t| t.market_id == new.market_id && t.name == new.name);
        if duplicate {
            return Err(GameError::Uniqueness(format!(
                "trader name {} already taken in market {}",
                new.name, new.market_id
            )));
        }

        tables.next_trader_id += 1;
        let trader = Trader {
            id: tables.next_trader_id,
            market_id: new.market_id.clone(),
            name: new.name.clone(),
            prod_cost: new.prod_cost,
            balance: new.balance,
            created_at: Utc::now(),
        };
        tables.traders.insert(trader.id, trader.clone());
        Ok(trader)
    }

    async fn get_trader(&self, trader_id: i64) -> Result<Trader> {
        self.tables.read().await.trader(trader_id).cloned()
    }

    async fn traders_in_market(&self, market_id: &str) -> Result<Vec<Trader>> {
        let tables = self.tables.read().await;
        Ok(tables
            .traders
            .values()
            .filter(|t| t.market_id == market_id)
            .cloned()
            .collect())
    }

    async fn delete_trader(&self, trader_id: i64) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.trader(trader_id)?;
        tables.remove_trader(trader_id);
        Ok(())
    }

    async fn insert_trade(&self, trade: &NewTrade) -> Result<Trade> {
        self.tables.write().await.insert_trade(trade)
    }

    async fn insert_trades(&self, trades: &[NewTrade]) -> Result<Vec<Trade>> {
        let mut tables = self.tables.write().await;
        let mut staged = tables.clone();
        let inserted = trades
            .iter()
            .map(|t| staged.insert_trade(t))
            .collect::<Result<Vec<_>>>()?;
        *tables = staged;
        Ok(inserted)
    }

    async fn get_trade(&self, trade_id: i64) -> Result<Trade> {
        self.tables
            .read()
            .await
            .trades
            .get(&trade_id)
            .cloned()
            .ok_or_else(|| GameError::trade_not_found(trade_id))
    }

    async fn trades_for_trader(&self, trader_id: i64, round: i64) -> Result<Vec<Trade>> {
        let tables = self.tables.read().await;
        Ok(tables
            .trades
            .values()
            .filter(|t| t.trader_id == trader_id && t.round == round)
            .cloned()
            .collect())
    }

    async fn trades_for_round(&self, market_id: &str, round: i64) -> Result<Vec<Trade>> {
        let tables = self.tables.read().await;
        Ok(tables
            .trades
            .values()
            .filter(|t| {
                t.round == round
                    && tables
                        .traders
                        .get(&t.trader_id)
                        .is_some_and(|tr| tr.market_id == market_id)
            })
            .cloned()
            .collect())
    }

    async fn update_trade_outcome(&self, outcome: &TradeOutcome) -> Result<Trade> {
        self.tables.write().await.write_outcome(outcome)
    }

    async fn round_stat(&self, market_id: &str, round: i64) -> Result<Option<RoundStat>> {
        let tables = self.tables.read().await;
        Ok(tables.round_stats.get(&(market_id.to_string(), round)).cloned())
    }

    async fn round_stats(&self, market_id: &str) -> Result<Vec<RoundStat>> {
        let tables = self.tables.read().await;
        Ok(tables
            .round_stats
            .values()
            .filter(|s| s.market_id == market_id)
            .cloned()
            .collect())
    }

    async fn commit_settlement(&self, batch: &SettlementBatch) -> Result<RoundStat> {
        let mut tables = self.tables.write().await;
        let already_settled = || GameError::AlreadySettled {
            market_id: batch.market_id.clone(),
            round: batch.round,
        };

        let market = tables.market(&batch.market_id)?;
        if market.round != batch.round {
            return Err(already_settled());
        }
        let key = (batch.market_id.clone(), batch.round);
        if tables.round_stats.contains_key(&key) {
            return Err(already_settled());
        }

        let fail_after = self.take_injected_failure();
        let mut staged = tables.clone();

        for (written, outcome) in batch.outcomes.iter().enumerate() {
            if fail_after == Some(written) {
                return Err(GameError::Storage(format!(
                    "injected failure after {written} trade writes"
                )));
            }
            let trade = staged.write_outcome(outcome)?;
            if trade.round != batch.round {
                return Err(GameError::Consistency(format!(
                    "trade {} is for round {}, not {}",
                    trade.id, trade.round, batch.round
                )));
            }
            let trader = staged
                .traders
                .get_mut(&outcome.trader_id)
                .filter(|t| t.market_id == batch.market_id)
                .ok_or_else(|| GameError::trader_not_found(outcome.trader_id))?;
            trader.balance = outcome.balance_after;
        }

        let stat = RoundStat {
            market_id: batch.market_id.clone(),
            round: batch.round,
            avg_price: batch.avg_price,
            created_at: Utc::now(),
        };
        staged.round_stats.insert(key, stat.clone());

        if let Some(market) = staged.markets.get_mut(&batch.market_id) {
            market.round = batch.round + 1;
            market.game_over |= batch.ends_game;
        }

        *tables = staged;
        Ok(stat)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
