//! SQLite entity store.
//!
//! Uses a sqlx connection pool. The schema is applied by [`SqliteStore::migrate`]
//! and carries the same uniqueness constraints the engine relies on:
//! one trade per (trader, round), one trader name per market, one stat per
//! (market, round). Settlement runs inside a single transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow,
};
use sqlx::{Row, Sqlite, Transaction};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use super::EntityStore;
use crate::error::{GameError, Result};
use crate::types::{
    Market, NewTrade, NewTrader, RoundStat, SettlementBatch, Trade, TradeOutcome, Trader,
};

const SCHEMA: &str = include_str!("schema.sql");

/// How long a writer waits for another connection's write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

const MARKET_COLUMNS: &str = "market_id, product_name_singular, product_name_plural, \
     alpha, beta, theta, min_cost, max_cost, initial_balance, \
     round, max_rounds, endless, game_over, created_at, created_by";

const TRADE_COLUMNS: &str = "id, trader_id, round, unit_price, unit_amount, was_forced, \
     demand, units_sold, profit, balance_after, created_at";

/// Entity store backed by a SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database at `url`, e.g. `sqlite://market_game.db`.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;
        info!(url, max_connections, "SQLite store connected");
        Ok(Self { pool })
    }

    /// A private in-memory database (used in tests). The pool holds exactly
    /// one connection that never expires, since each connection would
    /// otherwise see its own empty database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Open a transaction holding SQLite's write lock from `BEGIN`, so a
    /// read-then-write transaction never hits `SQLITE_BUSY` on lock upgrade.
    async fn begin_write(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin_with("BEGIN IMMEDIATE").await?)
    }

    /// Apply the schema. Safe to run on every start.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        debug!("Schema applied");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row decoding
// ---------------------------------------------------------------------------

fn decimal(row: &SqliteRow, col: &str) -> Result<Decimal> {
    let raw: String = row.try_get(col)?;
    parse_decimal(&raw, col)
}

fn opt_decimal(row: &SqliteRow, col: &str) -> Result<Option<Decimal>> {
    let raw: Option<String> = row.try_get(col)?;
    raw.map(|s| parse_decimal(&s, col)).transpose()
}

fn parse_decimal(raw: &str, col: &str) -> Result<Decimal> {
    Decimal::from_str(raw)
        .map_err(|e| GameError::Storage(format!("invalid decimal in column {col}: {raw} ({e})")))
}

fn timestamp(row: &SqliteRow, col: &str) -> Result<DateTime<Utc>> {
    let raw: String = row.try_get(col)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| GameError::Storage(format!("invalid timestamp in column {col}: {raw} ({e})")))
}

fn market_from_row(row: &SqliteRow) -> Result<Market> {
    Ok(Market {
        market_id: row.try_get("market_id")?,
        product_name_singular: row.try_get("product_name_singular")?,
        product_name_plural: row.try_get("product_name_plural")?,
        alpha: decimal(row, "alpha")?,
        beta: decimal(row, "beta")?,
        theta: decimal(row, "theta")?,
        min_cost: decimal(row, "min_cost")?,
        max_cost: decimal(row, "max_cost")?,
        initial_balance: decimal(row, "initial_balance")?,
        round: row.try_get("round")?,
        max_rounds: row.try_get("max_rounds")?,
        endless: row.try_get("endless")?,
        game_over: row.try_get("game_over")?,
        created_at: timestamp(row, "created_at")?,
        created_by: row.try_get("created_by")?,
    })
}

fn trader_from_row(row: &SqliteRow) -> Result<Trader> {
    Ok(Trader {
        id: row.try_get("id")?,
        market_id: row.try_get("market_id")?,
        name: row.try_get("name")?,
        prod_cost: decimal(row, "prod_cost")?,
        balance: decimal(row, "balance")?,
        created_at: timestamp(row, "created_at")?,
    })
}

fn trade_from_row(row: &SqliteRow) -> Result<Trade> {
    Ok(Trade {
        id: row.try_get("id")?,
        trader_id: row.try_get("trader_id")?,
        round: row.try_get("round")?,
        unit_price: opt_decimal(row, "unit_price")?,
        unit_amount: row.try_get("unit_amount")?,
        was_forced: row.try_get("was_forced")?,
        demand: row.try_get("demand")?,
        units_sold: row.try_get("units_sold")?,
        profit: opt_decimal(row, "profit")?,
        balance_after: opt_decimal(row, "balance_after")?,
        created_at: timestamp(row, "created_at")?,
    })
}

fn stat_from_row(row: &SqliteRow) -> Result<RoundStat> {
    Ok(RoundStat {
        market_id: row.try_get("market_id")?,
        round: row.try_get("round")?,
        avg_price: decimal(row, "avg_price")?,
        created_at: timestamp(row, "created_at")?,
    })
}

// ---------------------------------------------------------------------------
// Shared statements
// ---------------------------------------------------------------------------

async fn insert_trade_on(conn: &mut SqliteConnection, new: &NewTrade) -> Result<Trade> {
    let trader_exists = sqlx::query("SELECT 1 FROM traders WHERE id = ?")
        .bind(new.trader_id)
        .fetch_optional(&mut *conn)
        .await?
        .is_some();
    if !trader_exists {
        return Err(GameError::trader_not_found(new.trader_id));
    }

    let created_at = Utc::now();
    let result = sqlx::query(
        "INSERT INTO trades (trader_id, round, unit_price, unit_amount, was_forced, created_at) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(new.trader_id)
    .bind(new.round)
    .bind(new.unit_price.map(|p| p.to_string()))
    .bind(new.unit_amount)
    .bind(new.was_forced)
    .bind(created_at.to_rfc3339())
    .execute(&mut *conn)
    .await?;

    Ok(Trade {
        id: result.last_insert_rowid(),
        trader_id: new.trader_id,
        round: new.round,
        unit_price: new.unit_price,
        unit_amount: new.unit_amount,
        was_forced: new.was_forced,
        demand: None,
        units_sold: None,
        profit: None,
        balance_after: None,
        created_at,
    })
}

async fn write_outcome_on(conn: &mut SqliteConnection, outcome: &TradeOutcome) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE trades SET demand = ?, units_sold = ?, profit = ?, balance_after = ? \
         WHERE id = ? AND trader_id = ?",
    )
    .bind(outcome.demand)
    .bind(outcome.units_sold)
    .bind(outcome.profit.to_string())
    .bind(outcome.balance_after.to_string())
    .bind(outcome.trade_id)
    .bind(outcome.trader_id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

#[async_trait]
impl EntityStore for SqliteStore {
    async fn insert_market(&self, m: &Market) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO markets ({MARKET_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&m.market_id)
        .bind(&m.product_name_singular)
        .bind(&m.product_name_plural)
        .bind(m.alpha.to_string())
        .bind(m.beta.to_string())
        .bind(m.theta.to_string())
        .bind(m.min_cost.to_string())
        .bind(m.max_cost.to_string())
        .bind(m.initial_balance.to_string())
        .bind(m.round)
        .bind(m.max_rounds)
        .bind(m.endless)
        .bind(m.game_over)
        .bind(m.created_at.to_rfc3339())
        .bind(&m.created_by)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn market_exists(&self, market_id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM markets WHERE market_id = ?")
            .bind(market_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn get_market(&self, market_id: &str) -> Result<Market> {
        let row = sqlx::query(&format!("SELECT {MARKET_COLUMNS} FROM markets WHERE market_id = ?"))
            .bind(market_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| GameError::market_not_found(market_id))?;
        market_from_row(&row)
    }

    async fn update_market_settings(&self, m: &Market) -> Result<()> {
        let result = sqlx::query(
            "UPDATE markets SET product_name_singular = ?, product_name_plural = ?, \
             alpha = ?, beta = ?, theta = ?, min_cost = ?, max_cost = ?, \
             max_rounds = ?, endless = ? WHERE market_id = ?",
        )
        .bind(&m.product_name_singular)
        .bind(&m.product_name_plural)
        .bind(m.alpha.to_string())
        .bind(m.beta.to_string())
        .bind(m.theta.to_string())
        .bind(m.min_cost.to_string())
        .bind(m.max_cost.to_string())
        .bind(m.max_rounds)
        .bind(m.endless)
        .bind(&m.market_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(GameError::market_not_found(&m.market_id));
        }
        Ok(())
    }

    async fn markets_created_by(&self, owner: &str) -> Result<Vec<Market>> {
        let rows = sqlx::query(&format!(
            "SELECT {MARKET_COLUMNS} FROM markets WHERE created_by = ? ORDER BY created_at DESC"
        ))
        .bind(owner)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(market_from_row).collect()
    }

    async fn delete_market(&self, market_id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM markets WHERE market_id = ?")
            .bind(market_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(GameError::market_not_found(market_id));
        }
        debug!(market_id, "Market deleted");
        Ok(())
    }

    async fn insert_trader(&self, new: &NewTrader) -> Result<Trader> {
        if !self.market_exists(&new.market_id).await? {
            return Err(GameError::market_not_found(&new.market_id));
        }
        let created_at = Utc::now();
        let result = sqlx::query(
            "INSERT INTO traders (market_id, name, prod_cost, balance, created_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&new.market_id)
        .bind(&new.name)
        .bind(new.prod_cost.to_string())
        .bind(new.balance.to_string())
        .bind(created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(Trader {
            id: result.last_insert_rowid(),
            market_id: new.market_id.clone(),
            name: new.name.clone(),
            prod_cost: new.prod_cost,
            balance: new.balance,
            created_at,
        })
    }

    async fn get_trader(&self, trader_id: i64) -> Result<Trader> {
        let row = sqlx::query("SELECT * FROM traders WHERE id = ?")
            .bind(trader_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| GameError::trader_not_found(trader_id))?;
        trader_from_row(&row)
    }

    async fn traders_in_market(&self, market_id: &str) -> Result<Vec<Trader>> {
        let rows = sqlx::query("SELECT * FROM traders WHERE market_id = ? ORDER BY id")
            .bind(market_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(trader_from_row).collect()
    }

    async fn delete_trader(&self, trader_id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM traders WHERE id = ?")
            .bind(trader_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(GameError::trader_not_found(trader_id));
        }
        Ok(())
    }

    async fn insert_trade(&self, trade: &NewTrade) -> Result<Trade> {
        let mut conn = self.pool.acquire().await?;
        insert_trade_on(&mut conn, trade).await
    }

    async fn insert_trades(&self, trades: &[NewTrade]) -> Result<Vec<Trade>> {
        let mut tx = self.begin_write().await?;
        let mut inserted = Vec::with_capacity(trades.len());
        for trade in trades {
            // Dropping `tx` on error rolls the whole batch back.
            inserted.push(insert_trade_on(&mut tx, trade).await?);
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn get_trade(&self, trade_id: i64) -> Result<Trade> {
        let row = sqlx::query(&format!("SELECT {TRADE_COLUMNS} FROM trades WHERE id = ?"))
            .bind(trade_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| GameError::trade_not_found(trade_id))?;
        trade_from_row(&row)
    }

    async fn trades_for_trader(&self, trader_id: i64, round: i64) -> Result<Vec<Trade>> {
        let rows = sqlx::query(&format!(
            "SELECT {TRADE_COLUMNS} FROM trades WHERE trader_id = ? AND round = ? ORDER BY id"
        ))
        .bind(trader_id)
        .bind(round)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(trade_from_row).collect()
    }

    async fn trades_for_round(&self, market_id: &str, round: i64) -> Result<Vec<Trade>> {
        let rows = sqlx::query(
            "SELECT t.id, t.trader_id, t.round, t.unit_price, t.unit_amount, t.was_forced, \
                    t.demand, t.units_sold, t.profit, t.balance_after, t.created_at \
             FROM trades t JOIN traders tr ON tr.id = t.trader_id \
             WHERE tr.market_id = ? AND t.round = ? ORDER BY t.id",
        )
        .bind(market_id)
        .bind(round)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(trade_from_row).collect()
    }

    async fn update_trade_outcome(&self, outcome: &TradeOutcome) -> Result<Trade> {
        let mut conn = self.pool.acquire().await?;
        if write_outcome_on(&mut conn, outcome).await? == 0 {
            return Err(GameError::trade_not_found(outcome.trade_id));
        }
        drop(conn);
        self.get_trade(outcome.trade_id).await
    }

    async fn round_stat(&self, market_id: &str, round: i64) -> Result<Option<RoundStat>> {
        let row = sqlx::query("SELECT * FROM round_stats WHERE market_id = ? AND round = ?")
            .bind(market_id)
            .bind(round)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(stat_from_row).transpose()
    }

    async fn round_stats(&self, market_id: &str) -> Result<Vec<RoundStat>> {
        let rows = sqlx::query("SELECT * FROM round_stats WHERE market_id = ? ORDER BY round")
            .bind(market_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(stat_from_row).collect()
    }

    async fn commit_settlement(&self, batch: &SettlementBatch) -> Result<RoundStat> {
        let already_settled = || GameError::AlreadySettled {
            market_id: batch.market_id.clone(),
            round: batch.round,
        };

        // Any early return drops `tx`, which rolls back.
        let mut tx = self.begin_write().await?;

        let current: i64 = sqlx::query("SELECT round FROM markets WHERE market_id = ?")
            .bind(&batch.market_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| GameError::market_not_found(&batch.market_id))?
            .try_get("round")?;
        if current != batch.round {
            return Err(already_settled());
        }

        for outcome in &batch.outcomes {
            let trade_round: Option<i64> = sqlx::query("SELECT round FROM trades WHERE id = ?")
                .bind(outcome.trade_id)
                .fetch_optional(&mut *tx)
                .await?
                .map(|row| row.try_get("round"))
                .transpose()?;
            match trade_round {
                None => return Err(GameError::trade_not_found(outcome.trade_id)),
                Some(r) if r != batch.round => {
                    return Err(GameError::Consistency(format!(
                        "trade {} is for round {r}, not {}",
                        outcome.trade_id, batch.round
                    )))
                }
                Some(_) => {}
            }

            if write_outcome_on(&mut tx, outcome).await? != 1 {
                return Err(GameError::Consistency(format!(
                    "trade {} does not belong to trader {}",
                    outcome.trade_id, outcome.trader_id
                )));
            }

            let updated = sqlx::query("UPDATE traders SET balance = ? WHERE id = ? AND market_id = ?")
                .bind(outcome.balance_after.to_string())
                .bind(outcome.trader_id)
                .bind(&batch.market_id)
                .execute(&mut *tx)
                .await?;
            if updated.rows_affected() != 1 {
                return Err(GameError::trader_not_found(outcome.trader_id));
            }
        }

        let created_at = Utc::now();
        sqlx::query(
            "INSERT INTO round_stats (market_id, round, avg_price, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&batch.market_id)
        .bind(batch.round)
        .bind(batch.avg_price.to_string())
        .bind(created_at.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(|e| match GameError::from(e) {
            GameError::Uniqueness(_) => already_settled(),
            other => other,
        })?;

        let advanced = sqlx::query(
            "UPDATE markets SET round = round + 1, game_over = (game_over OR ?) \
             WHERE market_id = ? AND round = ?",
        )
        .bind(batch.ends_game)
        .bind(&batch.market_id)
        .bind(batch.round)
        .execute(&mut *tx)
        .await?;
        if advanced.rows_affected() != 1 {
            return Err(already_settled());
        }

        tx.commit().await?;

        Ok(RoundStat {
            market_id: batch.market_id.clone(),
            round: batch.round,
            avg_price: batch.avg_price,
            created_at,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
