//! Shared types for the market game.
//!
//! Markets, traders, trades and round statistics, plus the input structs
//! used to create them. Money is `rust_decimal::Decimal` throughout.

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Decimal places kept for money (prices, costs, balances, profit).
pub const MONEY_DP: u32 = 2;

/// Decimal places accepted for the demand-curve coefficients.
pub const CURVE_DP: u32 = 4;

/// Round a money amount to cents, half away from zero.
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(MONEY_DP, RoundingStrategy::MidpointAwayFromZero)
}

// ---------------------------------------------------------------------------
// Market
// ---------------------------------------------------------------------------

/// One configured instance of the game with its own demand curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Market {
    pub market_id: String,
    pub product_name_singular: String,
    pub product_name_plural: String,
    pub alpha: Decimal,
    pub beta: Decimal,
    pub theta: Decimal,
    pub min_cost: Decimal,
    pub max_cost: Decimal,
    /// Balance handed to every trader on join.
    pub initial_balance: Decimal,
    /// Current round. Only settlement moves it forward.
    pub round: i64,
    pub max_rounds: i64,
    pub endless: bool,
    pub game_over: bool,
    pub created_at: DateTime<Utc>,
    /// Owner reference. Nullable: removing the owner keeps the market.
    pub created_by: Option<String>,
}

impl fmt::Display for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}]:{},{},{}",
            self.market_id, self.round, self.alpha, self.beta, self.theta
        )
    }
}

impl Market {
    /// The demand-curve coefficients used by settlement.
    pub fn curve(&self) -> DemandCurve {
        DemandCurve {
            alpha: self.alpha,
            beta: self.beta,
            theta: self.theta,
        }
    }

    /// Whether settling `round` should end the game.
    pub fn ends_after(&self, round: i64) -> bool {
        !self.endless && round + 1 >= self.max_rounds
    }

    /// Build a market from validated creation input.
    pub fn from_new(market_id: String, new: NewMarket) -> Self {
        Self {
            market_id,
            product_name_singular: new.product_name_singular,
            product_name_plural: new.product_name_plural,
            alpha: new.alpha,
            beta: new.beta,
            theta: new.theta,
            min_cost: new.min_cost,
            max_cost: new.max_cost,
            initial_balance: new.initial_balance,
            round: 0,
            max_rounds: new.max_rounds,
            endless: new.endless,
            game_over: false,
            created_at: Utc::now(),
            created_by: new.created_by,
        }
    }
}

/// Linear demand curve: `alpha - beta * price + theta * avg_price`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DemandCurve {
    pub alpha: Decimal,
    pub beta: Decimal,
    pub theta: Decimal,
}

impl DemandCurve {
    /// Unrounded demand for a trader quoting `unit_price` in a round whose
    /// average price is `avg_price`. May be negative.
    pub fn demand(&self, unit_price: Decimal, avg_price: Decimal) -> Decimal {
        self.alpha - self.beta * unit_price + self.theta * avg_price
    }

    /// [`demand`](Self::demand), or `None` if an intermediate value leaves
    /// `Decimal`'s range.
    pub fn checked_demand(&self, unit_price: Decimal, avg_price: Decimal) -> Option<Decimal> {
        let supply_side = self.beta.checked_mul(unit_price)?;
        let market_side = self.theta.checked_mul(avg_price)?;
        self.alpha.checked_sub(supply_side)?.checked_add(market_side)
    }
}

/// Input for creating a market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMarket {
    pub product_name_singular: String,
    pub product_name_plural: String,
    pub alpha: Decimal,
    pub beta: Decimal,
    pub theta: Decimal,
    pub min_cost: Decimal,
    pub max_cost: Decimal,
    pub initial_balance: Decimal,
    #[serde(default = "default_max_rounds")]
    pub max_rounds: i64,
    #[serde(default)]
    pub endless: bool,
    #[serde(default)]
    pub created_by: Option<String>,
}

impl NewMarket {
    /// The classroom default: baguettes with a fixed cost of 8.
    #[cfg(test)]
    pub fn sample() -> Self {
        use rust_decimal_macros::dec;
        NewMarket {
            product_name_singular: "baguette".into(),
            product_name_plural: "baguettes".into(),
            alpha: dec!(105.0000),
            beta: dec!(17.5000),
            theta: dec!(14.5800),
            min_cost: dec!(8.00),
            max_cost: dec!(8.00),
            initial_balance: dec!(5000.00),
            max_rounds: 15,
            endless: false,
            created_by: None,
        }
    }
}

fn default_max_rounds() -> i64 {
    15
}

/// Host-editable market settings. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketUpdate {
    pub product_name_singular: Option<String>,
    pub product_name_plural: Option<String>,
    pub alpha: Option<Decimal>,
    pub beta: Option<Decimal>,
    pub theta: Option<Decimal>,
    pub min_cost: Option<Decimal>,
    pub max_cost: Option<Decimal>,
    pub max_rounds: Option<i64>,
    pub endless: Option<bool>,
}

impl MarketUpdate {
    /// Apply the update to a copy of `market`. Round and balances are never
    /// touched here.
    pub fn apply_to(&self, market: &Market) -> Market {
        let mut updated = market.clone();
        if let Some(ref s) = self.product_name_singular {
            updated.product_name_singular = s.clone();
        }
        if let Some(ref p) = self.product_name_plural {
            updated.product_name_plural = p.clone();
        }
        if let Some(alpha) = self.alpha {
            updated.alpha = alpha;
        }
        if let Some(beta) = self.beta {
            updated.beta = beta;
        }
        if let Some(theta) = self.theta {
            updated.theta = theta;
        }
        if let Some(min_cost) = self.min_cost {
            updated.min_cost = min_cost;
        }
        if let Some(max_cost) = self.max_cost {
            updated.max_cost = max_cost;
        }
        if let Some(max_rounds) = self.max_rounds {
            updated.max_rounds = max_rounds;
        }
        if let Some(endless) = self.endless {
            updated.endless = endless;
        }
        updated
    }
}

// ---------------------------------------------------------------------------
// Trader
// ---------------------------------------------------------------------------

/// A participant in one market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trader {
    pub id: i64,
    pub market_id: String,
    pub name: String,
    /// Per-unit production cost, fixed for the trader's lifetime.
    pub prod_cost: Decimal,
    pub balance: Decimal,
    pub created_at: DateTime<Utc>,
}

impl fmt::Display for Trader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] - ${}", self.name, self.market_id, self.balance)
    }
}

/// Input for inserting a trader. Cost and balance are resolved by intake.
#[derive(Debug, Clone)]
pub struct NewTrader {
    pub market_id: String,
    pub name: String,
    pub prod_cost: Decimal,
    pub balance: Decimal,
}

// ---------------------------------------------------------------------------
// Trade
// ---------------------------------------------------------------------------

/// One trader's decision for one round plus its settled outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: i64,
    pub trader_id: i64,
    /// The round this trade was submitted for.
    pub round: i64,
    pub unit_price: Option<Decimal>,
    pub unit_amount: Option<i64>,
    pub was_forced: bool,
    pub demand: Option<i64>,
    pub units_sold: Option<i64>,
    pub profit: Option<Decimal>,
    pub balance_after: Option<Decimal>,
    pub created_at: DateTime<Utc>,
}

impl fmt::Display for Trade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let price = self.unit_price.map(|p| p.to_string()).unwrap_or_else(|| "-".into());
        let amount = self.unit_amount.map(|a| a.to_string()).unwrap_or_else(|| "-".into());
        write!(f, "#{} ${} x {} [{}]", self.trader_id, price, amount, self.round)?;
        if self.was_forced {
            write!(f, " (forced)")?;
        }
        Ok(())
    }
}

impl Trade {
    /// Price used in settlement; a missing price counts as zero.
    pub fn price_or_zero(&self) -> Decimal {
        self.unit_price.unwrap_or(Decimal::ZERO)
    }

    /// Quantity used in settlement; a missing quantity counts as zero.
    pub fn amount_or_zero(&self) -> i64 {
        self.unit_amount.unwrap_or(0)
    }

    /// Whether settlement has written the outcome fields.
    pub fn is_settled(&self) -> bool {
        self.profit.is_some() && self.balance_after.is_some()
    }
}

/// Input for inserting a trade.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTrade {
    pub trader_id: i64,
    pub round: i64,
    pub unit_price: Option<Decimal>,
    pub unit_amount: Option<i64>,
    pub was_forced: bool,
}

impl NewTrade {
    /// A trader's own decision.
    pub fn decided(trader_id: i64, round: i64, unit_price: Decimal, unit_amount: i64) -> Self {
        Self {
            trader_id,
            round,
            unit_price: Some(unit_price),
            unit_amount: Some(unit_amount),
            was_forced: false,
        }
    }

    /// Zero price / zero quantity stand-in for a trader who did not decide.
    pub fn forced(trader_id: i64, round: i64) -> Self {
        Self {
            trader_id,
            round,
            unit_price: Some(Decimal::ZERO),
            unit_amount: Some(0),
            was_forced: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Round statistics
// ---------------------------------------------------------------------------

/// Per-round aggregate written by settlement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundStat {
    pub market_id: String,
    pub round: i64,
    pub avg_price: Decimal,
    pub created_at: DateTime<Utc>,
}

impl fmt::Display for RoundStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.market_id, self.round)
    }
}

// ---------------------------------------------------------------------------
// Settlement write set
// ---------------------------------------------------------------------------

/// Outcome of settlement for a single trade.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TradeOutcome {
    pub trade_id: i64,
    pub trader_id: i64,
    pub demand: i64,
    pub units_sold: i64,
    pub profit: Decimal,
    pub balance_after: Decimal,
}

/// Everything settlement writes for one round, committed atomically.
#[derive(Debug, Clone, PartialEq)]
pub struct SettlementBatch {
    pub market_id: String,
    /// The round being settled; the market moves to `round + 1`.
    pub round: i64,
    pub avg_price: Decimal,
    pub outcomes: Vec<TradeOutcome>,
    /// Set when this round was the market's last.
    pub ends_game: bool,
}

// ---------------------------------------------------------------------------
// Read-side projections
// ---------------------------------------------------------------------------

/// Trader counts for the host's progress display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MarketProgress {
    pub num_traders: usize,
    pub num_ready_traders: usize,
}

/// One row of the host's trader table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraderStatus {
    pub name: String,
    pub prod_cost: Decimal,
    pub balance: Decimal,
    pub ready: bool,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
