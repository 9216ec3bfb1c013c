// =============================================================================
// REST API — read-only projections over the store, plus market passthrough
// =============================================================================
//
// Everything here projects persisted rows or proxies the vendor; all
// simulation mutation happens over the WebSocket. The one write is the
// cascade delete, which purges a simulation and its orders, trades, and
// positions in a single transaction.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::debug;

use crate::app_state::AppState;
use crate::error::CoreError;
use crate::market_data::candle::{Candle, Interval};
use crate::market_data::source::MAX_PAGE_LIMIT;
use crate::persistence::models::{Order, Position, Simulation, Trade};
use crate::persistence::{orders, positions, simulations};
use crate::types::{SUPPORTED_SYMBOLS, DEFAULT_USER_ID, QUOTE_CURRENCY};

// =============================================================================
// Router construction
// =============================================================================

/// Build the full router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/market/historical", get(market_historical))
        .route("/market/symbols", get(market_symbols))
        .route("/market/earliest-time/:symbol", get(market_earliest_time))
        .route("/orders", get(list_orders))
        .route("/trades", get(list_trades))
        .route("/positions", get(list_positions))
        .route("/simulations", get(list_simulations))
        .route(
            "/simulations/:id",
            get(get_simulation).delete(delete_simulation),
        )
        .route("/simulations/:id/stats", get(simulation_stats))
        .route("/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Error mapping
// =============================================================================

/// Wrapper so handlers can `?` core errors straight into HTTP responses.
pub struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoreError::InvalidRequest(_) | CoreError::InvalidSpeed(_) => StatusCode::BAD_REQUEST,
            CoreError::SimulationNotFound(_) => StatusCode::NOT_FOUND,
            CoreError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            CoreError::VendorUnavailable(_) | CoreError::VendorRejected(_) => {
                StatusCode::BAD_GATEWAY
            }
            CoreError::InsufficientData => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({
            "kind": self.0.kind(),
            "message": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    #[serde(rename = "serverTime")]
    server_time: i64,
    #[serde(rename = "uptimeSecs")]
    uptime_secs: u64,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        server_time: chrono::Utc::now().timestamp_millis(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

// =============================================================================
// Market data passthrough
// =============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoricalQuery {
    symbol: String,
    interval: String,
    limit: Option<u32>,
    start_time: Option<i64>,
    end_time: Option<i64>,
}

async fn market_historical(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoricalQuery>,
) -> ApiResult<Vec<Candle>> {
    let interval = Interval::from_str(&query.interval)
        .ok_or_else(|| CoreError::InvalidRequest(format!("unknown interval: {}", query.interval)))?;
    let limit = query.limit.unwrap_or(500).min(MAX_PAGE_LIMIT);

    let candles = state
        .market_data
        .fetch_candles(
            &query.symbol,
            interval,
            limit,
            query.start_time,
            query.end_time,
        )
        .await?;
    debug!(symbol = %query.symbol, interval = %interval, count = candles.len(), "historical query served");
    Ok(Json(candles))
}

async fn market_symbols() -> Json<Vec<&'static str>> {
    Json(SUPPORTED_SYMBOLS.to_vec())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EarliestTimeResponse {
    symbol: String,
    earliest_time: i64,
}

async fn market_earliest_time(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> ApiResult<EarliestTimeResponse> {
    let earliest = state.market_data.earliest_available(&symbol).await?;
    Ok(Json(EarliestTimeResponse {
        symbol,
        earliest_time: earliest,
    }))
}

// =============================================================================
// Row projections
// =============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScopeQuery {
    simulation_id: Option<i64>,
}

async fn list_orders(
    State(state): State<Arc<AppState>>,
    Query(scope): Query<ScopeQuery>,
) -> ApiResult<Vec<Order>> {
    let rows = state
        .db
        .with_conn(move |conn| orders::list(conn, DEFAULT_USER_ID, scope.simulation_id))
        .await?;
    Ok(Json(rows))
}

async fn list_trades(
    State(state): State<Arc<AppState>>,
    Query(scope): Query<ScopeQuery>,
) -> ApiResult<Vec<Trade>> {
    let rows = state
        .db
        .with_conn(move |conn| orders::list_trades(conn, DEFAULT_USER_ID, scope.simulation_id))
        .await?;
    Ok(Json(rows))
}

async fn list_positions(
    State(state): State<Arc<AppState>>,
    Query(scope): Query<ScopeQuery>,
) -> ApiResult<Vec<Position>> {
    let rows = state
        .db
        .with_conn(move |conn| positions::list(conn, DEFAULT_USER_ID, scope.simulation_id))
        .await?;
    Ok(Json(rows))
}

async fn list_simulations(State(state): State<Arc<AppState>>) -> ApiResult<Vec<Simulation>> {
    let rows = state
        .db
        .with_conn(|conn| simulations::list(conn, DEFAULT_USER_ID))
        .await?;
    Ok(Json(rows))
}

async fn get_simulation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Simulation> {
    let sim = state
        .db
        .with_conn(move |conn| simulations::get(conn, id))
        .await?
        .ok_or(CoreError::SimulationNotFound(id))?;
    Ok(Json(sim))
}

async fn delete_simulation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state
        .db
        .with_tx(move |tx| simulations::delete_cascade(tx, id))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Stats projection
// =============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SimulationStats {
    simulation_id: i64,
    status: String,
    initial_funding: f64,
    order_count: i64,
    trade_count: i64,
    total_fees: f64,
    cash: f64,
    position_value: f64,
    total_value: f64,
    pnl: f64,
}

async fn simulation_stats(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<SimulationStats> {
    let stats = state
        .db
        .with_conn(move |conn| {
            let sim = simulations::get(conn, id)?.ok_or(CoreError::SimulationNotFound(id))?;
            let (order_count, trade_count, total_fees) = orders::activity_summary(conn, id)?;
            let holdings = positions::list(conn, DEFAULT_USER_ID, Some(id))?;

            let mut cash = 0.0;
            let mut position_value = 0.0;
            for p in &holdings {
                if p.symbol == QUOTE_CURRENCY {
                    cash += p.quantity;
                } else {
                    // Open holdings are valued at cost basis; a terminal
                    // simulation carries its snapshot in total_value.
                    position_value += p.quantity * p.average_price;
                }
            }
            let total_value = sim.total_value.unwrap_or(cash + position_value);

            Ok(SimulationStats {
                simulation_id: sim.id,
                status: sim.status.to_string(),
                initial_funding: sim.initial_funding,
                order_count,
                trade_count,
                total_fees,
                cash,
                position_value,
                total_value,
                pnl: total_value - sim.initial_funding,
            })
        })
        .await?;
    Ok(Json(stats))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
