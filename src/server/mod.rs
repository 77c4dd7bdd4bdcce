//! JSON HTTP surface over the simulation engine.

mod error;
mod market;
mod traders;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{routing::get, Json, Router};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::AppContext;

pub use error::AppError;

/// Shared handler state.
pub type AppState = Arc<AppContext>;

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Build the full application router.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .nest("/api/traders", traders::router())
        .nest("/api", market::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve on `addr` until `shutdown` is cancelled.
pub async fn serve(state: AppState, addr: SocketAddr, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    serve_on(state, listener, shutdown).await
}

async fn serve_on(
    state: AppState,
    listener: tokio::net::TcpListener,
    shutdown: CancellationToken,
) -> Result<()> {
    info!(addr = %listener.local_addr()?, "HTTP server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("HTTP server failed")?;

    info!("HTTP server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::FakeMarket;
    use crate::config::SimulatorConfig;
    use crate::models::VirtualTrader;
    use rust_decimal_macros::dec;
    use serde_json::{json, Value};

    #[test]
    fn test_health_response_serialization() {
        let response = HealthResponse {
            status: "ok",
            version: "1.0.0",
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"status\":\"ok\""));
        assert!(json.contains("\"version\":\"1.0.0\""));
    }

    async fn spawn_server() -> (String, Arc<FakeMarket>, CancellationToken) {
        let config = SimulatorConfig {
            database_url: "sqlite::memory:".to_string(),
            ..SimulatorConfig::default()
        };
        let market = Arc::new(FakeMarket::new());
        let ctx = AppContext::with_source(config, market.clone()).await.unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let shutdown = CancellationToken::new();
        tokio::spawn(serve_on(Arc::new(ctx), listener, shutdown.clone()));

        (base, market, shutdown)
    }

    #[tokio::test]
    async fn test_trader_lifecycle_over_http() {
        let (base, market, shutdown) = spawn_server().await;
        let client = reqwest::Client::new();

        let health: Value = client
            .get(format!("{}/health", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "ok");

        let response = client
            .post(format!("{}/api/traders", base))
            .json(&json!({"name": "alpha", "initial_balance": "10000", "leverage": 10}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::CREATED);
        let trader: VirtualTrader = response.json().await.unwrap();
        assert_eq!(trader.current_balance, dec!(10000));

        market.set_price("BTCUSDT", dec!(50000));
        let opened: Value = client
            .post(format!("{}/api/signals", base))
            .json(&json!({
                "symbol": "btc",
                "side": "LONG",
                "price": "50000",
                "confidence": 0.9,
                "indicator_scores": {"rsi": 0.8}
            }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(opened["symbol"], "BTCUSDT");
        assert_eq!(opened["opened"].as_array().unwrap().len(), 1);

        let missing = client
            .get(format!("{}/api/traders/nope", base))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
        let body: Value = missing.json().await.unwrap();
        assert_eq!(body["status"], 404);

        let deleted = client
            .delete(format!("{}/api/traders/{}", base, trader.id))
            .send()
            .await
            .unwrap();
        assert_eq!(deleted.status(), reqwest::StatusCode::NO_CONTENT);

        shutdown.cancel();
    }
}
