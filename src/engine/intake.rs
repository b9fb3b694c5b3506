//! Trade intake: market creation, joining, per-round decisions and
//! forced-trade synthesis for traders who did not decide in time.

use rand::Rng;
use rust_decimal::prelude::*;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::market_id::{new_unique_market_id, random_market_id, IdPolicy};
use crate::config::TradeLimits;
use crate::error::{GameError, Result};
use crate::storage::EntityStore;
use crate::types::{
    Market, MarketUpdate, NewMarket, NewTrade, NewTrader, Trade, Trader, CURVE_DP, MONEY_DP,
};

/// Longest accepted display name (trader and product names).
pub const MAX_NAME_LEN: usize = 16;

/// Largest accepted money amount for market settings.
const MAX_MONEY: Decimal = dec!(9999999999.99);

/// Smallest accepted production cost.
const MIN_COST: Decimal = dec!(0.01);

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn check_name(field: &str, value: &str) -> Result<()> {
    let len = value.trim().chars().count();
    if len == 0 {
        return Err(GameError::Validation(format!("{field} must not be empty")));
    }
    if value.chars().count() > MAX_NAME_LEN {
        return Err(GameError::Validation(format!(
            "{field} must be at most {MAX_NAME_LEN} characters"
        )));
    }
    Ok(())
}

fn check_places(field: &str, value: Decimal, dp: u32) -> Result<()> {
    if value.normalize().scale() > dp {
        return Err(GameError::Validation(format!(
            "{field} allows at most {dp} decimal places, got {value}"
        )));
    }
    Ok(())
}

fn check_range(field: &str, value: Decimal, min: Decimal, max: Decimal) -> Result<()> {
    if value < min || value > max {
        return Err(GameError::Validation(format!(
            "{field} must be between {min} and {max}, got {value}"
        )));
    }
    Ok(())
}

/// Validate a market's host-editable settings.
fn check_market(market: &Market) -> Result<()> {
    check_name("product_name_singular", &market.product_name_singular)?;
    check_name("product_name_plural", &market.product_name_plural)?;

    for (field, value) in [
        ("alpha", market.alpha),
        ("beta", market.beta),
        ("theta", market.theta),
    ] {
        check_range(field, value, Decimal::ZERO, dec!(9999999999.9999))?;
        check_places(field, value, CURVE_DP)?;
    }

    for (field, value) in [("min_cost", market.min_cost), ("max_cost", market.max_cost)] {
        check_range(field, value, MIN_COST, MAX_MONEY)?;
        check_places(field, value, MONEY_DP)?;
    }

    check_range("initial_balance", market.initial_balance, -MAX_MONEY, MAX_MONEY)?;
    check_places("initial_balance", market.initial_balance, MONEY_DP)?;

    if market.max_rounds < 1 {
        return Err(GameError::Validation(format!(
            "max_rounds must be at least 1, got {}",
            market.max_rounds
        )));
    }
    Ok(())
}

/// Validate a price/quantity decision against the configured limits.
pub fn check_decision(unit_price: Decimal, unit_amount: i64, limits: &TradeLimits) -> Result<()> {
    check_range("unit_price", unit_price, Decimal::ZERO, limits.max_unit_price)?;
    check_places("unit_price", unit_price, MONEY_DP)?;
    if unit_amount < 0 || unit_amount > limits.max_unit_amount {
        return Err(GameError::Validation(format!(
            "unit_amount must be between 0 and {}, got {unit_amount}",
            limits.max_unit_amount
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Markets and traders
// ---------------------------------------------------------------------------

/// Validate, allocate a unique market code, and insert a fresh market at
/// round 0.
pub async fn create_market<S, R>(
    store: &S,
    new: NewMarket,
    policy: &IdPolicy,
    rng: &mut R,
) -> Result<Market>
where
    S: EntityStore + ?Sized,
    R: Rng + Send + ?Sized,
{
    let mut market = Market::from_new(String::new(), new);
    check_market(&market)?;
    if market.min_cost > market.max_cost {
        warn!(
            min_cost = %market.min_cost,
            max_cost = %market.max_cost,
            "Market created with min_cost above max_cost"
        );
    }

    // The existence check and the insert are separate calls, so a concurrent
    // create can still claim the code in between. Draw again when it does.
    let mut insert_collisions = 0;
    loop {
        market.market_id = new_unique_market_id(store, policy, || random_market_id(rng)).await?;
        match store.insert_market(&market).await {
            Ok(()) => break,
            Err(GameError::Uniqueness(reason)) => {
                insert_collisions += 1;
                if insert_collisions >= policy.max_attempts {
                    warn!(attempts = insert_collisions, "Market id space exhausted at insert");
                    return Err(GameError::IdSpaceExhausted(policy.max_attempts));
                }
                debug!(market_id = %market.market_id, %reason, "Market id taken at insert, retrying");
            }
            Err(e) => return Err(e),
        }
    }

    info!(
        market_id = %market.market_id,
        alpha = %market.alpha,
        beta = %market.beta,
        theta = %market.theta,
        max_rounds = market.max_rounds,
        endless = market.endless,
        "Market created"
    );
    Ok(market)
}

/// Apply a host edit to a market's settings. The round counter is never
/// touched here.
pub async fn update_market<S>(store: &S, market_id: &str, update: &MarketUpdate) -> Result<Market>
where
    S: EntityStore + ?Sized,
{
    let current = store.get_market(market_id).await?;
    let updated = update.apply_to(&current);
    check_market(&updated)?;
    store.update_market_settings(&updated).await?;
    info!(market_id, "Market settings updated");
    store.get_market(market_id).await
}

/// Random whole-unit production cost within the market's cost bounds.
/// Falls back to `min_cost` when no whole number fits between the bounds.
pub fn random_prod_cost<R: Rng + ?Sized>(market: &Market, rng: &mut R) -> Decimal {
    let lo = market.min_cost.ceil().to_i64();
    let hi = market.max_cost.floor().to_i64();
    match (lo, hi) {
        (Some(lo), Some(hi)) if lo <= hi => {
            let mut cost = Decimal::from(rng.gen_range(lo..=hi));
            cost.rescale(MONEY_DP);
            cost
        }
        _ => market.min_cost,
    }
}

/// Add a trader to a market. Without an explicit `prod_cost` one is drawn
/// from the market's cost range. The balance starts at the market's
/// initial balance.
pub async fn join_market<S, R>(
    store: &S,
    market_id: &str,
    name: &str,
    prod_cost: Option<Decimal>,
    rng: &mut R,
) -> Result<Trader>
where
    S: EntityStore + ?Sized,
    R: Rng + Send + ?Sized,
{
    check_name("name", name)?;
    let market = store.get_market(market_id).await?;
    if market.game_over {
        return Err(GameError::GameOver(format!("market {market_id} has ended")));
    }

    let prod_cost = match prod_cost {
        Some(cost) => {
            check_range("prod_cost", cost, MIN_COST, MAX_MONEY)?;
            check_places("prod_cost", cost, MONEY_DP)?;
            cost
        }
        None => random_prod_cost(&market, rng),
    };

    let trader = store
        .insert_trader(&NewTrader {
            market_id: market_id.to_string(),
            name: name.to_string(),
            prod_cost,
            balance: market.initial_balance,
        })
        .await?;

    info!(
        market_id,
        trader_id = trader.id,
        name = %trader.name,
        prod_cost = %trader.prod_cost,
        "Trader joined"
    );
    Ok(trader)
}

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

/// Record a trader's decision for `round`.
///
/// The round must be the market's current one. A second decision for the
/// same round fails with `Uniqueness` and leaves the first untouched.
pub async fn submit_trade<S>(
    store: &S,
    trader_id: i64,
    round: i64,
    unit_price: Decimal,
    unit_amount: i64,
    limits: &TradeLimits,
) -> Result<Trade>
where
    S: EntityStore + ?Sized,
{
    let trader = store.get_trader(trader_id).await?;
    let market = store.get_market(&trader.market_id).await?;
    if market.game_over {
        return Err(GameError::GameOver(format!("market {} has ended", market.market_id)));
    }
    check_decision(unit_price, unit_amount, limits)?;
    if round != market.round {
        return Err(GameError::Validation(format!(
            "trade is for round {round} but market {} is at round {}",
            market.market_id, market.round
        )));
    }

    let trade = store
        .insert_trade(&NewTrade::decided(trader_id, round, unit_price, unit_amount))
        .await?;

    debug!(
        market_id = %market.market_id,
        trader_id,
        round,
        unit_price = %unit_price,
        unit_amount,
        "Trade submitted"
    );
    Ok(trade)
}

/// Create a zero price / zero quantity trade for every trader in `market`
/// who has no trade for the market's current round.
///
/// Idempotent: once every trader has a trade, nothing more is created.
/// A trader with more than one trade for the round is a consistency
/// failure and nothing is written.
pub async fn synthesize_forced_trades<S>(store: &S, market: &Market) -> Result<Vec<Trade>>
where
    S: EntityStore + ?Sized,
{
    let round = market.round;
    let traders = store.traders_in_market(&market.market_id).await?;
    let trades = store.trades_for_round(&market.market_id, round).await?;

    let mut per_trader: HashMap<i64, usize> = HashMap::new();
    for trade in &trades {
        *per_trader.entry(trade.trader_id).or_default() += 1;
    }
    if let Some((trader_id, count)) = per_trader.iter().find(|(_, &n)| n > 1) {
        return Err(GameError::Consistency(format!(
            "trader {trader_id} has {count} trades for round {round}"
        )));
    }

    let missing: Vec<NewTrade> = traders
        .iter()
        .filter(|t| !per_trader.contains_key(&t.id))
        .map(|t| NewTrade::forced(t.id, round))
        .collect();
    if missing.is_empty() {
        return Ok(Vec::new());
    }

    let forced = store.insert_trades(&missing).await?;
    info!(
        market_id = %market.market_id,
        round,
        forced = forced.len(),
        traders = traders.len(),
        "Forced trades created"
    );
    Ok(forced)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
