//! HTTP API: Axum server for hosts and polling trader clients.
//!
//! JSON in, JSON out. CORS enabled for browser clients.

pub mod routes;

use anyhow::{Context, Result};
use axum::{
    http::{header, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use tower_http::cors::CorsLayer;
use tracing::info;

pub use routes::AppState;

/// Serve the API on `addr` until `shutdown` resolves.
pub async fn serve<F>(state: AppState, addr: SocketAddr, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(%addr, "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")
}

/// Build the Axum router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(HeaderValue::from_static("*"))
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(routes::health))
        .route(
            "/api/markets",
            get(routes::list_markets).post(routes::create_market),
        )
        .route(
            "/api/markets/:market_id",
            get(routes::get_market)
                .patch(routes::update_market)
                .delete(routes::delete_market),
        )
        .route("/api/markets/:market_id/current-round", get(routes::current_round))
        .route(
            "/api/markets/:market_id/traders",
            get(routes::get_traders).post(routes::join_market),
        )
        .route(
            "/api/markets/:market_id/traders-this-round",
            get(routes::traders_this_round),
        )
        .route("/api/markets/:market_id/trades", post(routes::submit_trade))
        .route("/api/markets/:market_id/advance", post(routes::advance_round))
        .route("/api/markets/:market_id/rounds", get(routes::round_history))
        .route(
            "/api/traders/:trader_id",
            axum::routing::delete(routes::delete_trader),
        )
        .route("/api/traders/:trader_id/ready", get(routes::trader_ready))
        .layer(cors)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
