//! API route handlers.
//!
//! All endpoints return JSON. State is shared via `Arc<GameService>`.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::error;

use crate::engine::settlement::RoundReport;
use crate::engine::GameService;
use crate::error::GameError;
use crate::types::{Market, MarketUpdate, NewMarket, RoundStat, Trade, Trader, TraderStatus};

pub type AppState = Arc<GameService>;

type ApiResult<T> = Result<T, GameError>;

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

impl GameError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GameError::Validation(_) | GameError::Overflow(_) => StatusCode::UNPROCESSABLE_ENTITY,
            GameError::NotFound { .. } => StatusCode::NOT_FOUND,
            GameError::Uniqueness(_)
            | GameError::AlreadySettled { .. }
            | GameError::GameOver(_)
            | GameError::SettlementPrecondition(_)
            | GameError::Consistency(_) => StatusCode::CONFLICT,
            GameError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GameError::IdSpaceExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            GameError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GameError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }
        let body = Json(json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        }));
        (status, body).into_response()
    }
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct OwnerQuery {
    pub owner: String,
}

#[derive(Debug, Deserialize)]
pub struct JoinRequest {
    pub name: String,
    #[serde(default)]
    pub prod_cost: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
pub struct SubmitTradeRequest {
    pub trader_id: i64,
    pub round: i64,
    pub unit_price: Decimal,
    pub unit_amount: i64,
}

#[derive(Debug, Default, Deserialize)]
pub struct AdvanceRequest {
    /// Round the host believes is open. Protects against a repeated click.
    #[serde(default)]
    pub expected_round: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct RoundResponse {
    pub round: i64,
}

#[derive(Debug, Serialize)]
pub struct TraderTableResponse {
    pub traders: Vec<TraderStatus>,
    pub num_traders: usize,
    pub num_ready_traders: usize,
}

#[derive(Debug, Serialize)]
pub struct NamesResponse {
    pub traders: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

/// GET /health
pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// POST /api/markets
pub async fn create_market(
    State(state): State<AppState>,
    Json(new): Json<NewMarket>,
) -> ApiResult<(StatusCode, Json<Market>)> {
    let market = state.create_market(new).await?;
    Ok((StatusCode::CREATED, Json(market)))
}

/// GET /api/markets?owner=...
pub async fn list_markets(
    State(state): State<AppState>,
    Query(query): Query<OwnerQuery>,
) -> ApiResult<Json<Vec<Market>>> {
    Ok(Json(state.markets_created_by(&query.owner).await?))
}

/// GET /api/markets/:market_id
pub async fn get_market(
    State(state): State<AppState>,
    Path(market_id): Path<String>,
) -> ApiResult<Json<Market>> {
    Ok(Json(state.market(&market_id).await?))
}

/// PATCH /api/markets/:market_id
pub async fn update_market(
    State(state): State<AppState>,
    Path(market_id): Path<String>,
    Json(update): Json<MarketUpdate>,
) -> ApiResult<Json<Market>> {
    Ok(Json(state.update_market(&market_id, &update).await?))
}

/// DELETE /api/markets/:market_id
pub async fn delete_market(
    State(state): State<AppState>,
    Path(market_id): Path<String>,
) -> ApiResult<StatusCode> {
    state.delete_market(&market_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/markets/:market_id/current-round
pub async fn current_round(
    State(state): State<AppState>,
    Path(market_id): Path<String>,
) -> ApiResult<Json<RoundResponse>> {
    let round = state.current_round(&market_id).await?;
    Ok(Json(RoundResponse { round }))
}

/// GET /api/markets/:market_id/traders
pub async fn get_traders(
    State(state): State<AppState>,
    Path(market_id): Path<String>,
) -> ApiResult<Json<TraderTableResponse>> {
    let progress = state.market_progress(&market_id).await?;
    let traders = state.trader_table(&market_id).await?;
    Ok(Json(TraderTableResponse {
        traders,
        num_traders: progress.num_traders,
        num_ready_traders: progress.num_ready_traders,
    }))
}

/// POST /api/markets/:market_id/traders
pub async fn join_market(
    State(state): State<AppState>,
    Path(market_id): Path<String>,
    Json(req): Json<JoinRequest>,
) -> ApiResult<(StatusCode, Json<Trader>)> {
    let trader = state.join_market(&market_id, &req.name, req.prod_cost).await?;
    Ok((StatusCode::CREATED, Json(trader)))
}

/// GET /api/markets/:market_id/traders-this-round
pub async fn traders_this_round(
    State(state): State<AppState>,
    Path(market_id): Path<String>,
) -> ApiResult<Json<NamesResponse>> {
    let traders = state.traders_this_round(&market_id).await?;
    Ok(Json(NamesResponse { traders }))
}

/// POST /api/markets/:market_id/trades
pub async fn submit_trade(
    State(state): State<AppState>,
    Path(market_id): Path<String>,
    Json(req): Json<SubmitTradeRequest>,
) -> ApiResult<(StatusCode, Json<Trade>)> {
    let trade = state
        .submit_trade(
            &market_id,
            req.trader_id,
            req.round,
            req.unit_price,
            req.unit_amount,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(trade)))
}

/// POST /api/markets/:market_id/advance
pub async fn advance_round(
    State(state): State<AppState>,
    Path(market_id): Path<String>,
    Json(req): Json<AdvanceRequest>,
) -> ApiResult<Json<RoundReport>> {
    Ok(Json(state.advance_round(&market_id, req.expected_round).await?))
}

/// GET /api/markets/:market_id/rounds
pub async fn round_history(
    State(state): State<AppState>,
    Path(market_id): Path<String>,
) -> ApiResult<Json<Vec<RoundStat>>> {
    Ok(Json(state.round_history(&market_id).await?))
}

/// GET /api/traders/:trader_id/ready
pub async fn trader_ready(
    State(state): State<AppState>,
    Path(trader_id): Path<i64>,
) -> ApiResult<Json<ReadyResponse>> {
    let ready = state.is_ready(trader_id).await?;
    Ok(Json(ReadyResponse { ready }))
}

/// DELETE /api/traders/:trader_id
pub async fn delete_trader(
    State(state): State<AppState>,
    Path(trader_id): Path<i64>,
) -> ApiResult<StatusCode> {
    state.delete_trader(trader_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
