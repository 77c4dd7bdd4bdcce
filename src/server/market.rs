//! Signal intake, risk events, ticks, manual closes, rankings and prices.

use std::collections::HashMap;

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;

use crate::api::PriceQuote;
use crate::error::SimError;
use crate::models::{normalize_symbol, PaperTrade, Ranking, Signal, SimulatedPosition};
use crate::trading::UpdaterStats;

use super::error::Result;
use super::traders::RangeQuery;
use super::AppState;

#[derive(Debug, Serialize)]
pub struct SignalResponse {
    pub symbol: String,
    pub opened: Vec<SimulatedPosition>,
}

#[derive(Debug, Serialize)]
pub struct RiskResponse {
    pub symbol: String,
    pub reduced: usize,
}

#[derive(Debug, Serialize)]
pub struct TickResponse {
    pub closed: HashMap<String, Vec<PaperTrade>>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct RankingsResponse {
    pub range: &'static str,
    pub rankings: Vec<Ranking>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/positions/{id}/close", post(close_position))
        .route("/signals", post(submit_signal))
        .route("/risk/{symbol}", post(risk_signal))
        .route("/tick", post(tick))
        .route("/rankings", get(rankings))
        .route("/prices/{symbol}", get(price))
        .route("/updater", get(updater_stats))
}

/// POST /api/positions/{id}/close
async fn close_position(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PaperTrade>> {
    Ok(Json(state.engine.close_position_manual(&id).await?))
}

/// POST /api/signals
async fn submit_signal(
    State(state): State<AppState>,
    Json(mut signal): Json<Signal>,
) -> Result<Json<SignalResponse>> {
    signal.symbol = normalize_symbol(&signal.symbol);
    let opened = state.engine.process_signal(&signal).await?;
    Ok(Json(SignalResponse {
        symbol: signal.symbol,
        opened,
    }))
}

/// POST /api/risk/{symbol}
async fn risk_signal(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
) -> Result<Json<RiskResponse>> {
    let reduced = state.engine.handle_risk_signal(&symbol).await?;
    Ok(Json(RiskResponse {
        symbol: normalize_symbol(&symbol),
        reduced,
    }))
}

/// POST /api/tick
async fn tick(State(state): State<AppState>) -> Result<Json<TickResponse>> {
    let closed = state.updater.tick().await?;
    let total = closed.values().map(Vec::len).sum();
    Ok(Json(TickResponse { closed, total }))
}

/// GET /api/rankings?range=
async fn rankings(
    State(state): State<AppState>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<RankingsResponse>> {
    let range = query.time_range();
    let rankings = state.engine.rankings(range).await?;
    Ok(Json(RankingsResponse {
        range: range.as_str(),
        rankings,
    }))
}

/// GET /api/prices/{symbol}
async fn price(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
) -> Result<Json<PriceQuote>> {
    let symbol = normalize_symbol(&symbol);
    let quote = state
        .engine
        .price_tracker()
        .refresh_quote(&symbol)
        .await
        .ok_or_else(|| SimError::PriceUnavailable(symbol.clone()))?;
    Ok(Json(quote))
}

/// GET /api/updater
async fn updater_stats(State(state): State<AppState>) -> Json<UpdaterStats> {
    Json(state.updater.stats().await)
}
