// =============================================================================
// Persisted row types
// =============================================================================
//
// Serialization is camelCase because these rows flow verbatim into REST
// responses and WebSocket order events. Timestamps are integer milliseconds
// since epoch, in simulated time for order/trade execution fields.
// =============================================================================

use rusqlite::Row;
use serde::Serialize;

use crate::types::{OrderStatus, Side, SimulationStatus};

/// One replay session's persisted record.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Simulation {
    pub id: i64,
    pub user_id: i64,
    pub symbol: String,
    pub start_sim_time: i64,
    pub end_sim_time: Option<i64>,
    pub initial_funding: f64,
    pub mode: String,
    /// Opaque session parameters; carries at least `speed` and `timeframe`.
    pub extra_configs: serde_json::Value,
    pub status: SimulationStatus,
    pub total_value: Option<f64>,
    pub created_at: i64,
}

impl Simulation {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let extra_raw: String = row.get("extra_configs")?;
        let status_raw: String = row.get("status")?;
        Ok(Self {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            symbol: row.get("symbol")?,
            start_sim_time: row.get("start_sim_time")?,
            end_sim_time: row.get("end_sim_time")?,
            initial_funding: row.get("initial_funding")?,
            mode: row.get("mode")?,
            extra_configs: serde_json::from_str(&extra_raw)
                .unwrap_or_else(|_| serde_json::json!({})),
            status: parse_enum(&status_raw, SimulationStatus::from_str)?,
            total_value: row.get("total_value")?,
            created_at: row.get("created_at")?,
        })
    }
}

/// A market order row.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: i64,
    pub user_id: i64,
    pub simulation_id: i64,
    pub symbol: String,
    pub base_currency: String,
    pub side: Side,
    #[serde(rename = "type")]
    pub order_type: String,
    pub quantity: f64,
    pub status: OrderStatus,
    pub placed_at: i64,
    pub executed_at: Option<i64>,
    pub executed_price: Option<f64>,
    pub fee: f64,
}

impl Order {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let side_raw: String = row.get("side")?;
        let status_raw: String = row.get("status")?;
        Ok(Self {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            simulation_id: row.get("simulation_id")?,
            symbol: row.get("symbol")?,
            base_currency: row.get("base_currency")?,
            side: parse_enum(&side_raw, Side::from_str)?,
            order_type: row.get("order_type")?,
            quantity: row.get("quantity")?,
            status: parse_enum(&status_raw, OrderStatus::from_str)?,
            placed_at: row.get("placed_at")?,
            executed_at: row.get("executed_at")?,
            executed_price: row.get("executed_price")?,
            fee: row.get("fee")?,
        })
    }
}

/// An executed fill. Append-only; one per executed order.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    pub id: i64,
    pub order_id: i64,
    pub user_id: i64,
    pub simulation_id: i64,
    pub symbol: String,
    pub base_currency: String,
    pub side: Side,
    pub quantity: f64,
    pub price: f64,
    pub fee: f64,
    pub executed_at: i64,
}

impl Trade {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let side_raw: String = row.get("side")?;
        Ok(Self {
            id: row.get("id")?,
            order_id: row.get("order_id")?,
            user_id: row.get("user_id")?,
            simulation_id: row.get("simulation_id")?,
            symbol: row.get("symbol")?,
            base_currency: row.get("base_currency")?,
            side: parse_enum(&side_raw, Side::from_str)?,
            quantity: row.get("quantity")?,
            price: row.get("price")?,
            fee: row.get("fee")?,
            executed_at: row.get("executed_at")?,
        })
    }
}

/// A holding scoped to one simulation. The quote-currency row (symbol ==
/// "USDT") is the cash balance and keeps `average_price == 1`,
/// `total_cost == quantity`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub id: i64,
    pub user_id: i64,
    pub simulation_id: i64,
    pub symbol: String,
    pub base_currency: String,
    pub quantity: f64,
    pub average_price: f64,
    pub total_cost: f64,
}

impl Position {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            simulation_id: row.get("simulation_id")?,
            symbol: row.get("symbol")?,
            base_currency: row.get("base_currency")?,
            quantity: row.get("quantity")?,
            average_price: row.get("average_price")?,
            total_cost: row.get("total_cost")?,
        })
    }
}

/// Map a stored enum string back to its type, surfacing unknown values as a
/// column conversion failure instead of a panic.
fn parse_enum<T>(raw: &str, parse: impl Fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    parse(raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("unknown enum value: {raw}").into(),
        )
    })
}
