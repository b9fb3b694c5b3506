//! Read-only progress queries polled by traders and the host.

use std::collections::HashSet;

use crate::error::Result;
use crate::storage::EntityStore;
use crate::types::{Market, MarketProgress, RoundStat, TraderStatus};

/// Whether the trader has made their own decision for the market's current
/// round. A forced trade does not count.
pub async fn is_ready<S: EntityStore + ?Sized>(store: &S, trader_id: i64) -> Result<bool> {
    let trader = store.get_trader(trader_id).await?;
    let market = store.get_market(&trader.market_id).await?;
    let trades = store.trades_for_trader(trader_id, market.round).await?;
    Ok(trades.len() == 1 && !trades[0].was_forced)
}

/// Trader count and how many have a trade row for the current round.
pub async fn market_progress<S: EntityStore + ?Sized>(
    store: &S,
    market_id: &str,
) -> Result<MarketProgress> {
    let market = store.get_market(market_id).await?;
    let traders = store.traders_in_market(market_id).await?;
    let trades = store.trades_for_round(market_id, market.round).await?;
    Ok(MarketProgress {
        num_traders: traders.len(),
        num_ready_traders: trades.len(),
    })
}

pub async fn current_round<S: EntityStore + ?Sized>(store: &S, market_id: &str) -> Result<i64> {
    Ok(store.get_market(market_id).await?.round)
}

/// The host's monitor table: one row per trader, ordered by join.
pub async fn trader_table<S: EntityStore + ?Sized>(
    store: &S,
    market_id: &str,
) -> Result<Vec<TraderStatus>> {
    let market = store.get_market(market_id).await?;
    let traders = store.traders_in_market(market_id).await?;
    let trades = store.trades_for_round(market_id, market.round).await?;
    let decided: HashSet<i64> = trades
        .iter()
        .filter(|t| !t.was_forced)
        .map(|t| t.trader_id)
        .collect();

    Ok(traders
        .into_iter()
        .map(|t| TraderStatus {
            ready: decided.contains(&t.id),
            name: t.name,
            prod_cost: t.prod_cost,
            balance: t.balance,
        })
        .collect())
}

/// Names of the traders with a trade row for the current round.
pub async fn traders_this_round<S: EntityStore + ?Sized>(
    store: &S,
    market_id: &str,
) -> Result<Vec<String>> {
    let market = store.get_market(market_id).await?;
    let traders = store.traders_in_market(market_id).await?;
    let trades = store.trades_for_round(market_id, market.round).await?;
    let with_trade: HashSet<i64> = trades.iter().map(|t| t.trader_id).collect();

    Ok(traders
        .into_iter()
        .filter(|t| with_trade.contains(&t.id))
        .map(|t| t.name)
        .collect())
}

/// Settled rounds of a market, oldest first.
pub async fn round_history<S: EntityStore + ?Sized>(
    store: &S,
    market_id: &str,
) -> Result<Vec<RoundStat>> {
    // Distinguish an unknown market from one with no settled rounds.
    store.get_market(market_id).await?;
    store.round_stats(market_id).await
}

pub async fn markets_created_by<S: EntityStore + ?Sized>(
    store: &S,
    owner: &str,
) -> Result<Vec<Market>> {
    store.markets_created_by(owner).await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
