// =============================================================================
// WebSocket session — one client connection, one simulation
// =============================================================================
//
// On upgrade the session builds its task tree:
//
//   * reader (this task)  — parses inbound envelopes, dispatches commands;
//   * writer              — drains the bounded outbound queue, sends pings;
//   * paced ticker        — spawned when `Start` succeeds.
//
// All three share the engine behind one session-local mutex and a watch
// channel carrying the close signal: queue overflow, read-deadline expiry, or
// socket teardown on any side unwinds the whole tree through the same stop
// path.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{interval, timeout, Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::protocol::{
    Command, ConnectionStatus, ControlAck, ErrorInfo, OrderEvent, OutboundMessage,
};
use crate::app_state::AppState;
use crate::error::CoreError;
use crate::execution::OrderExecutor;
use crate::replay::engine::{run_ticker, CloseReason, EventSink, SimulationEngine};

/// Axum handler for the WebSocket upgrade request.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_session(socket, state))
}

// =============================================================================
// Session lifecycle
// =============================================================================

async fn handle_session(socket: WebSocket, state: Arc<AppState>) {
    let session_id = Uuid::new_v4();
    let (queue_capacity, tick_interval, ping_interval) = {
        let config = state.runtime_config.read();
        (
            config.event_queue_capacity,
            Duration::from_millis(config.tick_interval_ms),
            Duration::from_secs(config.ping_interval_secs),
        )
    };

    let (out_tx, out_rx) = mpsc::channel::<OutboundMessage>(queue_capacity);
    let (close_tx, close_rx) = watch::channel(CloseReason::Open);
    let close_tx = Arc::new(close_tx);

    let sink = EventSink::new(out_tx, close_tx.clone());
    let engine = Arc::new(Mutex::new(SimulationEngine::new(
        state.market_data.clone(),
        state.db.clone(),
        sink.clone(),
    )));
    let executor = OrderExecutor::new(state.db.clone());

    info!(session = %session_id, "websocket session opened");
    let _ = sink.emit(OutboundMessage::ConnectionStatus(ConnectionStatus {
        connected: true,
        session_id: session_id.to_string(),
    }));

    let (ws_tx, ws_rx) = socket.split();

    // Writer task: drains the queue and keeps the ping cadence.
    let writer = tokio::spawn(run_writer(
        ws_tx,
        out_rx,
        close_rx.clone(),
        ping_interval,
        session_id,
    ));

    // Reader loop runs in this task.
    run_reader(
        ws_rx,
        engine.clone(),
        executor,
        sink.clone(),
        close_rx,
        ping_interval,
        tick_interval,
        session_id,
    )
    .await;

    // Reader is done (client closed, deadline expired, or close signal).
    // Unwind the rest of the tree and release the engine.
    if !close_tx.borrow().is_closing() {
        let _ = close_tx.send(CloseReason::SessionEnded);
    }
    engine.lock().await.shutdown_on_disconnect().await;
    let _ = writer.await;

    info!(session = %session_id, "websocket session closed");
}

// =============================================================================
// Writer
// =============================================================================

async fn run_writer(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::Receiver<OutboundMessage>,
    mut close_rx: watch::Receiver<CloseReason>,
    ping_interval: Duration,
    session_id: Uuid,
) {
    let mut pings = interval(ping_interval);
    pings.tick().await; // the first tick fires immediately; skip it

    let mut reason = CloseReason::SessionEnded;
    loop {
        tokio::select! {
            msg = out_rx.recv() => {
                let Some(msg) = msg else { break };
                match serde_json::to_string(&msg) {
                    Ok(json) => {
                        if ws_tx.send(Message::Text(json)).await.is_err() {
                            debug!(session = %session_id, "writer send failed — closing");
                            break;
                        }
                    }
                    Err(e) => {
                        // Serialization bugs must not kill the connection.
                        warn!(session = %session_id, error = %e, "failed to serialize frame");
                    }
                }
            }
            _ = pings.tick() => {
                if ws_tx.send(Message::Ping(Vec::new())).await.is_err() {
                    debug!(session = %session_id, "ping failed — closing");
                    break;
                }
            }
            _ = close_rx.changed() => {
                let signalled = *close_rx.borrow();
                if signalled.is_closing() {
                    reason = signalled;
                    break;
                }
            }
        }
    }

    let _ = ws_tx
        .send(Message::Close(Some(axum::extract::ws::CloseFrame {
            code: axum::extract::ws::close_code::NORMAL,
            reason: reason.as_str().into(),
        })))
        .await;
}

// =============================================================================
// Reader
// =============================================================================

#[allow(clippy::too_many_arguments)]
async fn run_reader(
    mut ws_rx: SplitStream<WebSocket>,
    engine: Arc<Mutex<SimulationEngine>>,
    executor: OrderExecutor,
    sink: EventSink,
    mut close_rx: watch::Receiver<CloseReason>,
    ping_interval: Duration,
    tick_interval: Duration,
    session_id: Uuid,
) {
    // A silent peer that misses the ping-pong cadence for two intervals is
    // considered gone.
    let read_deadline = ping_interval * 2;

    loop {
        let frame = tokio::select! {
            frame = timeout(read_deadline, ws_rx.next()) => frame,
            _ = close_rx.changed() => {
                if close_rx.borrow().is_closing() {
                    debug!(session = %session_id, "close signal — reader exiting");
                    return;
                }
                continue;
            }
        };

        let msg = match frame {
            Err(_) => {
                warn!(session = %session_id, "read deadline expired — dropping connection");
                return;
            }
            Ok(None) => {
                debug!(session = %session_id, "websocket stream ended");
                return;
            }
            Ok(Some(Err(e))) => {
                warn!(session = %session_id, error = %e, "websocket receive error");
                return;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        match msg {
            Message::Text(text) => match Command::parse(&text) {
                Ok(command) => {
                    dispatch(
                        command,
                        &engine,
                        &executor,
                        &sink,
                        close_rx.clone(),
                        tick_interval,
                    )
                    .await;
                }
                Err(e) => {
                    debug!(session = %session_id, error = %e, "rejected inbound frame");
                    let _ = sink.emit(OutboundMessage::Error(ErrorInfo::from_error(&e)));
                }
            },
            Message::Pong(_) | Message::Ping(_) => {
                // Liveness only; the deadline reset is the recv itself.
            }
            Message::Close(_) => {
                info!(session = %session_id, "close frame received");
                return;
            }
            Message::Binary(_) => {
                debug!(session = %session_id, "binary frame ignored");
            }
        }
    }
}

// =============================================================================
// Command dispatch
// =============================================================================

async fn dispatch(
    command: Command,
    engine: &Arc<Mutex<SimulationEngine>>,
    executor: &OrderExecutor,
    sink: &EventSink,
    close_rx: watch::Receiver<CloseReason>,
    tick_interval: Duration,
) {
    let name = command.name();
    match command {
        Command::Start(req) => {
            let result = engine.lock().await.start(req).await;
            match result {
                Ok(()) => {
                    respond_control(sink, name, None);
                    tokio::spawn(run_ticker(engine.clone(), tick_interval, close_rx));
                }
                Err(e) => respond_control_error(sink, &e),
            }
        }
        Command::Stop => {
            let result = engine.lock().await.stop().await;
            match result {
                Ok(()) => respond_control(sink, name, None),
                Err(e) => respond_control_error(sink, &e),
            }
        }
        Command::Pause => {
            let result = engine.lock().await.pause().await;
            match result {
                Ok(()) => respond_control(sink, name, None),
                Err(e) => respond_control_error(sink, &e),
            }
        }
        Command::Resume => {
            let result = engine.lock().await.resume().await;
            match result {
                Ok(()) => respond_control(sink, name, None),
                Err(e) => respond_control_error(sink, &e),
            }
        }
        Command::SetSpeed(speed) => {
            let result = engine.lock().await.set_speed(speed).await;
            match result {
                Ok(()) => respond_control(sink, name, None),
                Err(e) => respond_control_error(sink, &e),
            }
        }
        Command::SetTimeframe(interval) => {
            let result = engine.lock().await.set_timeframe(interval).await;
            match result {
                Ok(()) => respond_control(sink, name, None),
                Err(e) => respond_control_error(sink, &e),
            }
        }
        Command::GetStatus => {
            let status = engine.lock().await.status();
            let _ = sink.emit(OutboundMessage::StatusUpdate(status));
        }
        Command::PlaceOrder(req) => {
            place_order(req, engine, executor, sink).await;
        }
    }
}

/// Order path: pull the live price from the engine, execute transactionally,
/// then emit `order_placed` / `order_executed` (or the error frame) in order.
async fn place_order(
    req: crate::api::protocol::PlaceOrderRequest,
    engine: &Arc<Mutex<SimulationEngine>>,
    executor: &OrderExecutor,
    sink: &EventSink,
) {
    let snapshot = {
        let mut engine = engine.lock().await;
        match engine.market_snapshot() {
            Ok(snap) => snap,
            Err(e) => {
                let _ = sink.emit(OutboundMessage::OrderControlError(ErrorInfo::from_error(&e)));
                return;
            }
        }
    };

    if req.symbol != snapshot.symbol {
        let e = CoreError::InvalidRequest(format!(
            "order symbol {} does not match session symbol {}",
            req.symbol, snapshot.symbol
        ));
        let _ = sink.emit(OutboundMessage::OrderControlError(ErrorInfo::from_error(&e)));
        return;
    }

    // The price is passed explicitly; the executor never calls back into the
    // engine, and the engine lock is already released here.
    let result = executor
        .execute_market(
            crate::types::DEFAULT_USER_ID,
            snapshot.simulation_id,
            &snapshot.symbol,
            req.side,
            req.quantity,
            snapshot.price,
            snapshot.sim_time,
        )
        .await;

    match result {
        Ok(outcome) => {
            let _ = sink.emit(OutboundMessage::OrderPlaced(OrderEvent {
                order: outcome.placed,
                trade: None,
            }));
            let _ = sink.emit(OutboundMessage::OrderExecuted(OrderEvent {
                order: outcome.order,
                trade: Some(outcome.trade),
            }));
            let _ = sink.emit(OutboundMessage::OrderControlResponse(ControlAck {
                command: "order_place".into(),
                message: None,
            }));
        }
        Err(e) => {
            let _ = sink.emit(OutboundMessage::OrderControlError(ErrorInfo::from_error(&e)));
        }
    }
}

fn respond_control(sink: &EventSink, command: &str, message: Option<String>) {
    let _ = sink.emit(OutboundMessage::SimulationControlResponse(ControlAck {
        command: command.to_string(),
        message,
    }));
}

fn respond_control_error(sink: &EventSink, err: &CoreError) {
    let _ = sink.emit(OutboundMessage::SimulationControlError(ErrorInfo::from_error(
        err,
    )));
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // The session plumbing is exercised end-to-end in tests/session_replay.rs
    // against a live server; here we only pin the engine/executor state
    // interplay that the dispatcher relies on.

    use crate::market_data::candle::{Candle, Interval};
    use crate::market_data::source::MarketDataSource;
    use crate::persistence::Database;
    use async_trait::async_trait;
    use chrono::Utc;

    struct FlatVendor;

    #[async_trait]
    impl MarketDataSource for FlatVendor {
        async fn fetch_candles(
            &self,
            _symbol: &str,
            interval: Interval,
            limit: u32,
            start_time: Option<i64>,
            end_time: Option<i64>,
        ) -> crate::error::CoreResult<Vec<Candle>> {
            let len = interval.len_ms();
            let now = Utc::now().timestamp_millis();
            let open_cap = end_time.unwrap_or(i64::MAX);
            let mut t = interval.align(start_time.unwrap_or(0));
            let mut out = Vec::new();
            while t + len <= now && t <= open_cap && out.len() < limit as usize {
                out.push(Candle {
                    start_time: t,
                    end_time: t + len,
                    open: 50_000.0,
                    high: 50_000.0,
                    low: 50_000.0,
                    close: 50_000.0,
                    volume: 1.0,
                    is_complete: true,
                });
                t += len;
            }
            Ok(out)
        }

        async fn earliest_available(&self, _symbol: &str) -> crate::error::CoreResult<i64> {
            Ok(0)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn order_for_wrong_symbol_is_rejected_without_touching_the_store() {
        let (tx, mut rx) = mpsc::channel(64);
        let (close_tx, close_rx) = watch::channel(CloseReason::Open);
        let _ = close_rx;
        let sink = EventSink::new(tx, Arc::new(close_tx));
        let db = Database::open_in_memory().unwrap();
        let engine = Arc::new(Mutex::new(SimulationEngine::new(
            Arc::new(FlatVendor),
            db.clone(),
            sink.clone(),
        )));
        let executor = OrderExecutor::new(db.clone());

        let anchor = Interval::M5.align(Utc::now().timestamp_millis() - 3_600_000) + 120_000;
        engine
            .lock()
            .await
            .start(crate::api::protocol::StartRequest {
                symbol: "BTCUSDT".into(),
                start_time: anchor,
                interval: Interval::M5,
                speed: 60,
                initial_funding: 10_000.0,
            })
            .await
            .unwrap();
        tokio::time::advance(Duration::from_millis(200)).await;
        engine.lock().await.tick().await;
        while rx.try_recv().is_ok() {}

        place_order(
            crate::api::protocol::PlaceOrderRequest {
                symbol: "ETHUSDT".into(),
                side: crate::types::Side::Buy,
                quantity: 0.1,
            },
            &engine,
            &executor,
            &sink,
        )
        .await;

        match rx.try_recv().unwrap() {
            OutboundMessage::OrderControlError(info) => {
                assert_eq!(info.kind, "InvalidRequest");
            }
            other => panic!("expected order_control_error, got {other:?}"),
        }

        let orders = db
            .with_conn(|conn| crate::persistence::orders::list(conn, 1, None))
            .await
            .unwrap();
        assert!(orders.is_empty());
    }
}
