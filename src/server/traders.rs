//! Trader endpoints: CRUD, clone, reset and per-trader reporting.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::models::{
    NewTrader, PaperTrade, SimulatedPosition, TimeRange, TraderMetrics, TraderUpdate,
    VirtualTrader,
};
use crate::trading::TraderSummary;

use super::error::{AppError, Result};
use super::AppState;

#[derive(Debug, Serialize)]
pub struct TradersListResponse {
    pub traders: Vec<VirtualTrader>,
    pub total: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct RangeQuery {
    pub range: Option<String>,
}

impl RangeQuery {
    pub fn time_range(&self) -> TimeRange {
        self.range.as_deref().map(TimeRange::parse).unwrap_or_default()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct CloneQuery {
    pub name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TradesResponse {
    pub range: &'static str,
    pub trades: Vec<PaperTrade>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_traders).post(create_trader))
        .route(
            "/{id}",
            get(get_trader).patch(update_trader).delete(delete_trader),
        )
        .route("/{id}/clone", post(clone_trader))
        .route("/{id}/reset", post(reset_trader))
        .route("/{id}/positions", get(open_positions))
        .route("/{id}/trades", get(trades))
        .route("/{id}/metrics", get(metrics))
}

/// GET /api/traders
async fn list_traders(State(state): State<AppState>) -> Result<Json<TradersListResponse>> {
    let traders = state.engine.traders().list().await?;
    let total = traders.len();
    Ok(Json(TradersListResponse { traders, total }))
}

/// POST /api/traders
async fn create_trader(
    State(state): State<AppState>,
    Json(request): Json<NewTrader>,
) -> Result<(StatusCode, Json<VirtualTrader>)> {
    let trader = state.engine.traders().create(request).await?;
    Ok((StatusCode::CREATED, Json(trader)))
}

/// GET /api/traders/{id}
async fn get_trader(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TraderSummary>> {
    Ok(Json(state.engine.trader_summary(&id).await?))
}

/// PATCH /api/traders/{id}
async fn update_trader(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<TraderUpdate>,
) -> Result<Json<VirtualTrader>> {
    Ok(Json(state.engine.traders().update(&id, update).await?))
}

/// DELETE /api/traders/{id}
async fn delete_trader(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    if state.engine.delete_trader(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!("Trader not found: {}", id)))
    }
}

/// POST /api/traders/{id}/clone?name=
async fn clone_trader(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<CloneQuery>,
) -> Result<(StatusCode, Json<VirtualTrader>)> {
    let trader = state.engine.traders().clone_trader(&id, query.name).await?;
    Ok((StatusCode::CREATED, Json(trader)))
}

/// POST /api/traders/{id}/reset
async fn reset_trader(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<VirtualTrader>> {
    Ok(Json(state.engine.reset_trader(&id).await?))
}

/// GET /api/traders/{id}/positions
async fn open_positions(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<SimulatedPosition>>> {
    state.engine.traders().require(&id).await?;
    let positions = state
        .engine
        .position_manager()
        .store()
        .open_by_trader(&id)
        .await?;
    Ok(Json(positions))
}

/// GET /api/traders/{id}/trades?range=
async fn trades(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<TradesResponse>> {
    let range = query.time_range();
    let trades = state.engine.trades(&id, range).await?;
    Ok(Json(TradesResponse {
        range: range.as_str(),
        trades,
    }))
}

/// GET /api/traders/{id}/metrics?range=
async fn metrics(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<TraderMetrics>> {
    Ok(Json(state.engine.trader_metrics(&id, query.time_range()).await?))
}
