// =============================================================================
// WebSocket wire protocol — {type, data} envelopes in both directions
// =============================================================================

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::market_data::candle::{Candle, Interval};
use crate::persistence::models::{Order, Trade};
use crate::types::Side;

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct InboundEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// Start payload:
/// `{"symbol":"BTCUSDT","startTime":<ms>,"interval":"5m","speed":60,"initialFunding":10000}`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub symbol: String,
    pub start_time: i64,
    pub interval: Interval,
    pub speed: u32,
    pub initial_funding: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetSpeedRequest {
    pub speed: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetTimeframeRequest {
    pub timeframe: Interval,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceOrderRequest {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
}

/// A parsed client command.
#[derive(Debug, Clone)]
pub enum Command {
    Start(StartRequest),
    Stop,
    Pause,
    Resume,
    SetSpeed(u32),
    SetTimeframe(Interval),
    GetStatus,
    PlaceOrder(PlaceOrderRequest),
}

impl Command {
    /// Parse one inbound text frame. Malformed JSON, an unknown `type`, or a
    /// payload that does not match the type all surface as `InvalidRequest`.
    pub fn parse(text: &str) -> CoreResult<Self> {
        let envelope: InboundEnvelope = serde_json::from_str(text)
            .map_err(|e| CoreError::InvalidRequest(format!("malformed frame: {e}")))?;

        match envelope.kind.as_str() {
            "simulation_control_start" => Ok(Self::Start(payload(envelope.data)?)),
            "simulation_control_stop" => Ok(Self::Stop),
            "simulation_control_pause" => Ok(Self::Pause),
            "simulation_control_resume" => Ok(Self::Resume),
            "simulation_control_set_speed" => {
                let req: SetSpeedRequest = payload(envelope.data)?;
                Ok(Self::SetSpeed(req.speed))
            }
            "simulation_control_set_timeframe" => {
                let req: SetTimeframeRequest = payload(envelope.data)?;
                Ok(Self::SetTimeframe(req.timeframe))
            }
            "simulation_control_get_status" => Ok(Self::GetStatus),
            "order_place" => Ok(Self::PlaceOrder(payload(envelope.data)?)),
            other => Err(CoreError::InvalidRequest(format!(
                "unknown message type: {other}"
            ))),
        }
    }

    /// The command name used in control acks and error frames.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start(_) => "start",
            Self::Stop => "stop",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::SetSpeed(_) => "set_speed",
            Self::SetTimeframe(_) => "set_timeframe",
            Self::GetStatus => "get_status",
            Self::PlaceOrder(_) => "order_place",
        }
    }
}

fn payload<T: DeserializeOwned>(data: serde_json::Value) -> CoreResult<T> {
    serde_json::from_value(data)
        .map_err(|e| CoreError::InvalidRequest(format!("invalid payload: {e}")))
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// Every frame the server can push. Serializes to the same
/// `{"type": ..., "data": ...}` envelope the client sends.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum OutboundMessage {
    StatusUpdate(StatusUpdate),
    SimulationUpdate(SimulationUpdate),
    OrderPlaced(OrderEvent),
    OrderExecuted(OrderEvent),
    SimulationControlResponse(ControlAck),
    SimulationControlError(ErrorInfo),
    OrderControlResponse(ControlAck),
    OrderControlError(ErrorInfo),
    ConnectionStatus(ConnectionStatus),
    Error(ErrorInfo),
}

/// Session status snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<u32>,
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub simulation_time: Option<i64>,
    #[serde(rename = "simulationID", skip_serializing_if = "Option::is_none")]
    pub simulation_id: Option<i64>,
    pub is_running: bool,
}

/// One replay tick: the current (complete or incomplete) candle plus clock
/// state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationUpdate {
    pub price: f64,
    pub timestamp: i64,
    pub ohlcv: Candle,
    pub progress: f64,
    pub speed: u32,
    pub state: String,
    pub simulation_time: i64,
}

/// Order lifecycle event: the full order row, plus the trade row once
/// executed.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderEvent {
    pub order: Order,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trade: Option<Trade>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlAck {
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    pub kind: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn from_error(err: &CoreError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub connected: bool,
    pub session_id: String,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
