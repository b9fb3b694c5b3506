//! Domain error taxonomy.
//!
//! Every store and engine operation returns [`GameError`]. Callers can tell a
//! duplicate insert from a missing record from a settlement that already ran,
//! which the API layer maps onto HTTP status codes.

use std::time::Duration;

/// Domain-specific error types for the market game.
#[derive(Debug, thiserror::Error)]
pub enum GameError {
    /// Malformed or out-of-range input. Surfaced to the submitter for correction.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Duplicate trade for (trader, round), duplicate trader name, duplicate
    /// market id or duplicate round statistic.
    #[error("Uniqueness violation: {0}")]
    Uniqueness(String),

    /// Settlement inputs are incomplete; run forced-trade synthesis first.
    #[error("Settlement precondition failed: {0}")]
    SettlementPrecondition(String),

    #[error("Round {round} of market {market_id} is already settled")]
    AlreadySettled { market_id: String, round: i64 },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Game over: {0}")]
    GameOver(String),

    /// Stored rows contradict an invariant (e.g. two trades for one round).
    #[error("Consistency error: {0}")]
    Consistency(String),

    /// Round arithmetic left the representable range. Nothing was written.
    #[error("Arithmetic overflow: {0}")]
    Overflow(String),

    #[error("Could not find a free market id after {0} attempts")]
    IdSpaceExhausted(u32),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, GameError>;

impl GameError {
    pub fn market_not_found(id: &str) -> Self {
        GameError::NotFound {
            entity: "Market",
            id: id.to_string(),
        }
    }

    pub fn trader_not_found(id: i64) -> Self {
        GameError::NotFound {
            entity: "Trader",
            id: id.to_string(),
        }
    }

    pub fn trade_not_found(id: i64) -> Self {
        GameError::NotFound {
            entity: "Trade",
            id: id.to_string(),
        }
    }
}

impl From<sqlx::Error> for GameError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                GameError::Uniqueness(db.message().to_string())
            }
            other => GameError::Storage(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
