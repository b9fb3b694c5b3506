//! Settlement. Turns a round's trades into demand, sales, profit and new
//! balances, then commits them and advances the market's round.
//!
//! The arithmetic lives in [`compute_settlement`], a pure function over the
//! round's `(Trade, Trader)` pairs. [`settle_round`] adds the precondition
//! and double-settlement checks around it and hands the result to the
//! store as one atomic write.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::*;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::error::{GameError, Result};
use crate::storage::EntityStore;
use crate::types::{
    round_money, DemandCurve, Market, RoundStat, SettlementBatch, Trade, TradeOutcome, Trader,
};

// ---------------------------------------------------------------------------
// Pure computation
// ---------------------------------------------------------------------------

/// Result of the round arithmetic, before anything is written.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundComputation {
    /// Mean quoted price over every trade, forced ones included. Rounded to
    /// cents for storage; demand uses the exact mean.
    pub avg_price: Decimal,
    /// One outcome per trade, ordered by trade id.
    pub outcomes: Vec<TradeOutcome>,
}

fn overflow(what: &str) -> GameError {
    GameError::Overflow(format!("{what} is out of range"))
}

/// Round a demand value to whole units, half away from zero.
fn demand_units(demand: Decimal) -> Result<i64> {
    demand
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .ok_or_else(|| GameError::Overflow(format!("demand {demand} is out of range")))
}

/// Compute every trader's outcome for one round.
///
/// `units_sold` is `min(demand, unit_amount)` with no floor at zero, so a
/// negative demand produces negative units sold and raises profit by
/// `unit_price × |units_sold|`. Missing prices and amounts count as zero.
pub fn compute_settlement(
    curve: &DemandCurve,
    entries: &[(Trade, Trader)],
) -> Result<RoundComputation> {
    if entries.is_empty() {
        return Err(GameError::SettlementPrecondition(
            "cannot settle a round without trades".into(),
        ));
    }

    let total = entries
        .iter()
        .try_fold(Decimal::ZERO, |acc, (t, _)| acc.checked_add(t.price_or_zero()))
        .ok_or_else(|| overflow("sum of prices"))?;
    let avg_exact = total / Decimal::from(entries.len());

    let mut ordered: Vec<&(Trade, Trader)> = entries.iter().collect();
    ordered.sort_by_key(|(t, _)| t.id);

    let mut outcomes = Vec::with_capacity(ordered.len());
    for (trade, trader) in ordered {
        let price = trade.price_or_zero();
        let amount = trade.amount_or_zero();

        let demand = curve
            .checked_demand(price, avg_exact)
            .ok_or_else(|| overflow(&format!("demand for trade {}", trade.id)))?;
        let demand = demand_units(demand)?;
        let units_sold = demand.min(amount);

        let profit = trader
            .prod_cost
            .checked_mul(Decimal::from(amount))
            .and_then(|expenses| {
                price
                    .checked_mul(Decimal::from(units_sold))?
                    .checked_sub(expenses)
            })
            .map(round_money)
            .ok_or_else(|| overflow(&format!("profit for trade {}", trade.id)))?;
        let balance_after = trader
            .balance
            .checked_add(profit)
            .map(round_money)
            .ok_or_else(|| overflow(&format!("balance of trader {}", trader.id)))?;

        outcomes.push(TradeOutcome {
            trade_id: trade.id,
            trader_id: trader.id,
            demand,
            units_sold,
            profit,
            balance_after,
        });
    }

    Ok(RoundComputation {
        avg_price: round_money(avg_exact),
        outcomes,
    })
}

/// Pair each trade of `round` with its trader, checking that every trader
/// has exactly one trade and every trade belongs to one of the traders.
fn pair_trades(
    traders: &[Trader],
    trades: Vec<Trade>,
    round: i64,
) -> Result<Vec<(Trade, Trader)>> {
    if traders.is_empty() {
        return Err(GameError::SettlementPrecondition(
            "market has no traders".into(),
        ));
    }
    if trades.is_empty() {
        return Err(GameError::SettlementPrecondition(format!(
            "no trades for round {round}"
        )));
    }

    let by_id: HashMap<i64, &Trader> = traders.iter().map(|t| (t.id, t)).collect();
    let mut counts: HashMap<i64, usize> = HashMap::new();
    let mut entries = Vec::with_capacity(trades.len());

    for trade in trades {
        if trade.round != round {
            return Err(GameError::SettlementPrecondition(format!(
                "trade {} is for round {}, expected {round}",
                trade.id, trade.round
            )));
        }
        let trader = by_id.get(&trade.trader_id).ok_or_else(|| {
            GameError::SettlementPrecondition(format!(
                "trade {} belongs to trader {} outside the market",
                trade.id, trade.trader_id
            ))
        })?;
        *counts.entry(trader.id).or_default() += 1;
        entries.push((trade, (*trader).clone()));
    }

    for trader in traders {
        match counts.get(&trader.id).copied().unwrap_or(0) {
            1 => {}
            0 => {
                return Err(GameError::SettlementPrecondition(format!(
                    "trader {} has no trade for round {round}",
                    trader.name
                )))
            }
            n => {
                return Err(GameError::SettlementPrecondition(format!(
                    "trader {} has {n} trades for round {round}",
                    trader.name
                )))
            }
        }
    }

    entries.sort_by_key(|(t, _)| t.id);
    Ok(entries)
}

// ---------------------------------------------------------------------------
// Round report
// ---------------------------------------------------------------------------

/// Summary of one settled round, returned to the host.
#[derive(Debug, Clone, Serialize)]
pub struct RoundReport {
    pub market_id: String,
    /// The round that was settled.
    pub round: i64,
    pub avg_price: Decimal,
    pub num_trades: usize,
    pub num_forced: usize,
    pub outcomes: Vec<TradeOutcome>,
    /// True when this round was the market's last.
    pub game_over: bool,
    pub stat: RoundStat,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Store-backed settlement
// ---------------------------------------------------------------------------

/// Settle `market`'s current round and advance it.
///
/// `market` is the caller's snapshot; its `round` names the round to
/// settle. Fails with `AlreadySettled` if that round already has a stat or
/// the stored market has moved on, and with `SettlementPrecondition` when
/// the trades don't line up one-to-one with the traders. Nothing is
/// written on failure.
pub async fn settle_round<S>(store: &S, market: &Market) -> Result<RoundReport>
where
    S: EntityStore + ?Sized,
{
    let round = market.round;
    let already_settled = || GameError::AlreadySettled {
        market_id: market.market_id.clone(),
        round,
    };

    if store.round_stat(&market.market_id, round).await?.is_some() {
        return Err(already_settled());
    }
    let stored = store.get_market(&market.market_id).await?;
    if stored.round > round {
        return Err(already_settled());
    }
    if stored.round < round {
        return Err(GameError::SettlementPrecondition(format!(
            "market {} is at round {}, cannot settle round {round}",
            stored.market_id, stored.round
        )));
    }

    let traders = store.traders_in_market(&stored.market_id).await?;
    let trades = store.trades_for_round(&stored.market_id, round).await?;
    let entries = pair_trades(&traders, trades, round)?;
    let num_forced = entries.iter().filter(|(t, _)| t.was_forced).count();

    let computed = compute_settlement(&stored.curve(), &entries)?;
    for outcome in &computed.outcomes {
        if outcome.units_sold < 0 {
            warn!(
                market_id = %stored.market_id,
                round,
                trader_id = outcome.trader_id,
                units_sold = outcome.units_sold,
                "Negative demand produced negative units sold"
            );
        }
        debug!(
            trade_id = outcome.trade_id,
            demand = outcome.demand,
            units_sold = outcome.units_sold,
            profit = %outcome.profit,
            balance_after = %outcome.balance_after,
            "Trade settled"
        );
    }

    let batch = SettlementBatch {
        market_id: stored.market_id.clone(),
        round,
        avg_price: computed.avg_price,
        outcomes: computed.outcomes,
        ends_game: stored.ends_after(round),
    };
    let stat = store.commit_settlement(&batch).await?;

    let report = RoundReport {
        market_id: batch.market_id,
        round,
        avg_price: batch.avg_price,
        num_trades: entries.len(),
        num_forced,
        outcomes: batch.outcomes,
        game_over: batch.ends_game,
        stat,
        timestamp: Utc::now(),
    };

    info!(
        market_id = %report.market_id,
        round,
        traders = report.num_trades,
        forced = report.num_forced,
        avg_price = %report.avg_price,
        game_over = report.game_over,
        "Round settled"
    );
    Ok(report)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
