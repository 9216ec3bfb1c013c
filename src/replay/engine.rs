// =============================================================================
// Simulation Engine — per-session replay coordinator
// =============================================================================
//
// Owns the session clock, replay buffer, aggregator, and the state machine:
//
//   Idle ──Start──▶ Running ◀──Resume── Paused
//                     │  ▲                │
//                     │  └──SetSpeed/SetTimeframe (self-loop)
//                     │
//          Stop / fatal error ──▶ Stopped      sim time reaches now ──▶ Completed
//
// The paced ticker calls `tick` every ~200 ms of real time; each tick banks
// `realΔt × speed` into simulated time, emits every candle whose period
// closed since the previous tick, then the incomplete candle of the open
// period. Vendor hiccups retry in-engine with bounded backoff before the
// session is stopped with an error frame.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

use crate::api::protocol::{
    ErrorInfo, OutboundMessage, SimulationUpdate, StartRequest, StatusUpdate,
};
use crate::error::{CoreError, CoreResult};
use crate::market_data::aggregator::CandleAggregator;
use crate::market_data::candle::{Candle, Interval};
use crate::market_data::source::MarketDataSource;
use crate::persistence::{positions, simulations, Database};
use crate::replay::buffer::ReplayBuffer;
use crate::replay::clock::SessionClock;
use crate::types::{
    is_recognized_speed, is_supported_symbol, SimulationStatus, DEFAULT_USER_ID, QUOTE_CURRENCY,
};

/// Real-time cadence the paced ticker targets between emissions.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(200);

/// Backoff schedule for vendor retries inside the engine.
const FETCH_BACKOFF: [Duration; 3] = [
    Duration::from_millis(250),
    Duration::from_millis(1_000),
    Duration::from_millis(4_000),
];

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Running,
    Paused,
    Stopped,
    Completed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Completed)
    }

    fn as_status(&self) -> Option<SimulationStatus> {
        match self {
            Self::Idle => None,
            Self::Running => Some(SimulationStatus::Running),
            Self::Paused => Some(SimulationStatus::Paused),
            Self::Stopped => Some(SimulationStatus::Stopped),
            Self::Completed => Some(SimulationStatus::Completed),
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Event sink
// ---------------------------------------------------------------------------

/// Why a session's socket tasks are being told to shut down. Carried on the
/// session's watch channel; the writer echoes it as the close-frame reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Session still live.
    Open,
    /// Outbound queue overflowed; the client is dropped.
    SlowConsumer,
    /// Normal teardown (client closed or server shutdown).
    SessionEnded,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::SlowConsumer => "slow consumer",
            Self::SessionEnded => "session ended",
        }
    }

    pub fn is_closing(&self) -> bool {
        *self != Self::Open
    }
}

/// Non-blocking handle to the session's outbound frame queue.
///
/// `emit` never waits: a full queue means the client is not draining frames,
/// which surfaces as `SlowConsumer` and tears the session down. The sink also
/// carries the close signal that unwinds the reader/writer task pair.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<OutboundMessage>,
    close: Arc<watch::Sender<CloseReason>>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<OutboundMessage>, close: Arc<watch::Sender<CloseReason>>) -> Self {
        Self { tx, close }
    }

    pub fn emit(&self, msg: OutboundMessage) -> CoreResult<()> {
        self.tx.try_send(msg).map_err(|_| CoreError::SlowConsumer)
    }

    /// Drop the client: it cannot keep up with the event stream.
    pub fn request_close(&self) {
        let _ = self.close.send(CloseReason::SlowConsumer);
    }
}

// ---------------------------------------------------------------------------
// Active replay
// ---------------------------------------------------------------------------

struct ActiveReplay {
    simulation_id: i64,
    symbol: String,
    interval: Interval,
    anchor_ms: i64,
    clock: SessionClock,
    buffer: ReplayBuffer,
    aggregator: CandleAggregator,
    /// Open time of the period simulated time currently sits in.
    period_start: i64,
    /// Close of the last candle emitted; the price orders execute at.
    last_price: Option<f64>,
}

/// Inputs the order path pulls from the engine at execution time.
#[derive(Debug, Clone)]
pub struct MarketSnapshot {
    pub simulation_id: i64,
    pub symbol: String,
    pub price: f64,
    pub sim_time: i64,
}

enum Drive {
    Continue,
    Complete,
    /// `None` means the outbound queue overflowed (no error frame possible).
    Fatal(Option<CoreError>),
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct SimulationEngine {
    source: Arc<dyn MarketDataSource>,
    db: Database,
    events: EventSink,
    state: SessionState,
    replay: Option<ActiveReplay>,
}

impl SimulationEngine {
    pub fn new(source: Arc<dyn MarketDataSource>, db: Database, events: EventSink) -> Self {
        Self {
            source,
            db,
            events,
            state: SessionState::Idle,
            replay: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    // -------------------------------------------------------------------------
    // Control transitions
    // -------------------------------------------------------------------------

    /// Validate and launch a new replay. Leaves the engine `Running` with a
    /// primed buffer; the caller spawns the paced ticker on success.
    pub async fn start(&mut self, req: StartRequest) -> CoreResult<()> {
        if self.state != SessionState::Idle {
            return Err(CoreError::AlreadyRunning);
        }
        if !is_supported_symbol(&req.symbol) {
            return Err(CoreError::InvalidRequest(format!(
                "unsupported symbol: {}",
                req.symbol
            )));
        }
        if !is_recognized_speed(req.speed) {
            return Err(CoreError::InvalidSpeed(req.speed));
        }
        if !req.initial_funding.is_finite() || req.initial_funding <= 0.0 {
            return Err(CoreError::InvalidRequest(format!(
                "initial funding must be positive, got {}",
                req.initial_funding
            )));
        }
        let wall_now = Utc::now().timestamp_millis();
        if req.start_time >= wall_now {
            return Err(CoreError::InvalidRequest(
                "anchor timestamp must be in the past".into(),
            ));
        }

        // Persist the simulation record and seed the cash position together.
        let extra = serde_json::json!({
            "speed": req.speed,
            "timeframe": req.interval.as_str(),
        })
        .to_string();
        let (symbol, anchor, funding) = (req.symbol.clone(), req.start_time, req.initial_funding);
        let sim = self
            .db
            .with_tx(move |tx| {
                let sim = simulations::create(
                    tx,
                    DEFAULT_USER_ID,
                    &symbol,
                    anchor,
                    funding,
                    &extra,
                    wall_now,
                )?;
                positions::apply_delta(
                    tx,
                    DEFAULT_USER_ID,
                    sim.id,
                    QUOTE_CURRENCY,
                    QUOTE_CURRENCY,
                    funding,
                    1.0,
                )?;
                Ok(sim)
            })
            .await?;

        // Prime the buffer with the first page from the anchor period.
        let mut buffer = ReplayBuffer::new(&req.symbol, req.interval, anchor);
        if let Err(e) = prime_with_retry(&mut buffer, self.source.as_ref()).await {
            warn!(simulation_id = sim.id, error = %e, "priming failed — aborting start");
            let sim_id = sim.id;
            let _ = self
                .db
                .with_conn(move |conn| {
                    simulations::finish(conn, sim_id, SimulationStatus::Stopped, anchor, funding)
                })
                .await;
            return Err(e);
        }

        self.replay = Some(ActiveReplay {
            simulation_id: sim.id,
            symbol: req.symbol.clone(),
            interval: req.interval,
            anchor_ms: anchor,
            clock: SessionClock::new(anchor, req.speed),
            buffer,
            aggregator: CandleAggregator::new(self.source.clone()),
            period_start: req.interval.align(anchor),
            last_price: None,
        });
        self.state = SessionState::Running;

        info!(
            simulation_id = sim.id,
            symbol = %req.symbol,
            anchor,
            interval = %req.interval,
            speed = req.speed,
            funding,
            "replay started"
        );
        let _ = self.events.emit(OutboundMessage::StatusUpdate(self.status()));
        Ok(())
    }

    pub async fn pause(&mut self) -> CoreResult<()> {
        if self.state != SessionState::Running {
            return Err(CoreError::InvalidRequest(
                "pause requires a running simulation".into(),
            ));
        }
        let replay = self.replay.as_mut().expect("running session has a replay");
        replay.clock.pause();
        let sim_id = replay.simulation_id;

        if let Err(e) = self
            .db
            .with_conn(move |conn| simulations::set_status(conn, sim_id, SimulationStatus::Paused))
            .await
        {
            let _ = self
                .events
                .emit(OutboundMessage::Error(ErrorInfo::from_error(&e)));
            let _ = self.finish(SessionState::Stopped).await;
            return Err(e);
        }

        self.state = SessionState::Paused;
        info!(simulation_id = sim_id, "replay paused");
        let _ = self.events.emit(OutboundMessage::StatusUpdate(self.status()));
        Ok(())
    }

    pub async fn resume(&mut self) -> CoreResult<()> {
        if self.state != SessionState::Paused {
            return Err(CoreError::InvalidRequest(
                "resume requires a paused simulation".into(),
            ));
        }
        let replay = self.replay.as_mut().expect("paused session has a replay");
        replay.clock.resume();
        let sim_id = replay.simulation_id;

        if let Err(e) = self
            .db
            .with_conn(move |conn| simulations::set_status(conn, sim_id, SimulationStatus::Running))
            .await
        {
            let _ = self
                .events
                .emit(OutboundMessage::Error(ErrorInfo::from_error(&e)));
            let _ = self.finish(SessionState::Stopped).await;
            return Err(e);
        }

        self.state = SessionState::Running;
        info!(simulation_id = sim_id, "replay resumed");
        let _ = self.events.emit(OutboundMessage::StatusUpdate(self.status()));
        Ok(())
    }

    /// Change the replay speed. Takes effect from the next tick; simulated
    /// time never jumps.
    pub async fn set_speed(&mut self, speed: u32) -> CoreResult<()> {
        if self.state != SessionState::Running {
            return Err(CoreError::InvalidRequest(
                "set_speed requires a running simulation".into(),
            ));
        }
        if !is_recognized_speed(speed) {
            return Err(CoreError::InvalidSpeed(speed));
        }
        let replay = self.replay.as_mut().expect("running session has a replay");
        replay.clock.set_speed(speed);
        let (sim_id, interval) = (replay.simulation_id, replay.interval);

        self.persist_extra_configs(sim_id, speed, interval).await?;
        info!(simulation_id = sim_id, speed, "replay speed changed");
        let _ = self.events.emit(OutboundMessage::StatusUpdate(self.status()));
        Ok(())
    }

    /// Switch the aggregation interval. The current partial candle is
    /// dropped; the next emission starts a fresh incomplete candle on the
    /// new grid.
    pub async fn set_timeframe(&mut self, interval: Interval) -> CoreResult<()> {
        if self.state != SessionState::Running {
            return Err(CoreError::InvalidRequest(
                "set_timeframe requires a running simulation".into(),
            ));
        }
        let replay = self.replay.as_mut().expect("running session has a replay");
        let sim_time = replay.clock.advance();
        replay.interval = interval;
        replay.period_start = interval.align(sim_time);
        replay.buffer.realign(interval, sim_time);
        replay.aggregator.reset();
        let (sim_id, speed) = (replay.simulation_id, replay.clock.speed());

        self.persist_extra_configs(sim_id, speed, interval).await?;
        info!(simulation_id = sim_id, interval = %interval, "replay timeframe changed");
        let _ = self.events.emit(OutboundMessage::StatusUpdate(self.status()));
        Ok(())
    }

    /// User-requested stop.
    pub async fn stop(&mut self) -> CoreResult<()> {
        if !matches!(self.state, SessionState::Running | SessionState::Paused) {
            return Err(CoreError::InvalidRequest(
                "no active simulation to stop".into(),
            ));
        }
        self.finish(SessionState::Stopped).await
    }

    /// Connection-loss path: same terminal transition as `stop`, but a no-op
    /// when nothing is active.
    pub async fn shutdown_on_disconnect(&mut self) {
        if matches!(self.state, SessionState::Running | SessionState::Paused) {
            if let Err(e) = self.finish(SessionState::Stopped).await {
                error!(error = %e, "failed to persist terminal state on disconnect");
            }
        }
    }

    async fn persist_extra_configs(
        &mut self,
        sim_id: i64,
        speed: u32,
        interval: Interval,
    ) -> CoreResult<()> {
        let extra = serde_json::json!({
            "speed": speed,
            "timeframe": interval.as_str(),
        })
        .to_string();
        if let Err(e) = self
            .db
            .with_conn(move |conn| simulations::update_extra_configs(conn, sim_id, &extra))
            .await
        {
            let _ = self
                .events
                .emit(OutboundMessage::Error(ErrorInfo::from_error(&e)));
            let _ = self.finish(SessionState::Stopped).await;
            return Err(e);
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Terminal transition
    // -------------------------------------------------------------------------

    /// Enter a terminal state: freeze the clock, snapshot `end_sim_time` and
    /// `total_value` onto the record, and push a final status frame.
    async fn finish(&mut self, terminal: SessionState) -> CoreResult<()> {
        let Some(replay) = self.replay.as_mut() else {
            self.state = terminal;
            return Ok(());
        };

        replay.clock.pause();
        let sim_time = replay.clock.sim_time();
        let sim_id = replay.simulation_id;
        let last_price = replay.last_price;
        let status = terminal.as_status().unwrap_or(SimulationStatus::Stopped);

        self.state = terminal;

        let persisted = self
            .db
            .with_conn(move |conn| {
                let holdings = positions::list(conn, DEFAULT_USER_ID, Some(sim_id))?;
                let mut total_value = 0.0;
                for p in &holdings {
                    if p.symbol == QUOTE_CURRENCY {
                        total_value += p.quantity;
                    } else {
                        // Value open holdings at the last replay price; fall
                        // back to cost basis when no candle was ever seen.
                        total_value += p.quantity * last_price.unwrap_or(p.average_price);
                    }
                }
                simulations::finish(conn, sim_id, status, sim_time, total_value)?;
                Ok(total_value)
            })
            .await;

        match persisted {
            Ok(total_value) => {
                info!(
                    simulation_id = sim_id,
                    state = %terminal,
                    end_sim_time = sim_time,
                    total_value,
                    "replay finished"
                );
                let _ = self.events.emit(OutboundMessage::StatusUpdate(self.status()));
                Ok(())
            }
            Err(e) => {
                error!(simulation_id = sim_id, error = %e, "failed to persist terminal snapshot");
                let _ = self
                    .events
                    .emit(OutboundMessage::Error(ErrorInfo::from_error(&e)));
                Err(e)
            }
        }
    }

    /// Fatal mid-session failure: surface the cause, then stop.
    async fn fail(&mut self, err: CoreError) {
        warn!(error = %err, kind = err.kind(), "session failed — stopping");
        let _ = self
            .events
            .emit(OutboundMessage::Error(ErrorInfo::from_error(&err)));
        let _ = self.finish(SessionState::Stopped).await;
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Current status payload (also the `get_status` response).
    pub fn status(&self) -> StatusUpdate {
        let wall_now = Utc::now().timestamp_millis();
        match &self.replay {
            Some(r) => StatusUpdate {
                state: self.state.as_str().to_string(),
                symbol: Some(r.symbol.clone()),
                interval: Some(r.interval.to_string()),
                speed: Some(r.clock.speed()),
                progress: progress(r.anchor_ms, r.clock.sim_time(), wall_now),
                current_price: r.last_price,
                simulation_time: Some(r.clock.sim_time()),
                simulation_id: Some(r.simulation_id),
                is_running: self.state == SessionState::Running,
            },
            None => StatusUpdate {
                state: self.state.as_str().to_string(),
                symbol: None,
                interval: None,
                speed: None,
                progress: 0.0,
                current_price: None,
                simulation_time: None,
                simulation_id: None,
                is_running: false,
            },
        }
    }

    /// Pull the inputs a market order executes against. Orders are only
    /// accepted while the replay is running and a price has been observed.
    pub fn market_snapshot(&mut self) -> CoreResult<MarketSnapshot> {
        if self.state != SessionState::Running {
            return Err(CoreError::InvalidRequest(
                "orders require a running simulation".into(),
            ));
        }
        let replay = self.replay.as_mut().expect("running session has a replay");
        let sim_time = replay.clock.advance();
        let price = replay.last_price.ok_or_else(|| {
            CoreError::InvalidRequest("no replay price observed yet".into())
        })?;
        Ok(MarketSnapshot {
            simulation_id: replay.simulation_id,
            symbol: replay.symbol.clone(),
            price,
            sim_time,
        })
    }

    // -------------------------------------------------------------------------
    // Paced tick
    // -------------------------------------------------------------------------

    /// One paced tick. Returns `false` once the session is terminal and the
    /// ticker should exit.
    pub async fn tick(&mut self) -> bool {
        match self.state {
            SessionState::Running => {}
            SessionState::Idle | SessionState::Paused => return true,
            SessionState::Stopped | SessionState::Completed => return false,
        }

        let wall_now = Utc::now().timestamp_millis();
        match self.drive(wall_now).await {
            Drive::Continue => true,
            Drive::Complete => {
                if let Err(e) = self.finish(SessionState::Completed).await {
                    error!(error = %e, "failed to finalize completed replay");
                }
                false
            }
            Drive::Fatal(Some(err)) => {
                self.fail(err).await;
                false
            }
            Drive::Fatal(None) => {
                // Queue overflow: the client cannot keep up. Stop the
                // simulation and drop the connection.
                warn!("outbound queue overflow — dropping slow consumer");
                let _ = self.finish(SessionState::Stopped).await;
                self.events.request_close();
                false
            }
        }
    }

    async fn drive(&mut self, wall_now: i64) -> Drive {
        let events = self.events.clone();
        let source = self.source.clone();
        let replay = self.replay.as_mut().expect("running session has a replay");

        let sim_time = replay.clock.advance();
        if sim_time >= wall_now {
            debug!(sim_time, wall_now, "replay caught up with wall clock");
            return Drive::Complete;
        }

        let len = replay.interval.len_ms();
        let speed = replay.clock.speed();

        // Emit every period that closed since the last tick (several when the
        // speed multiplier outruns the tick cadence).
        while sim_time >= replay.period_start + len {
            let period_start = replay.period_start;
            match take_candle_with_retry(&mut replay.buffer, source.as_ref(), period_start).await {
                Ok(Some(candle)) => {
                    replay.last_price = Some(candle.close);
                    let update = SimulationUpdate {
                        price: candle.close,
                        timestamp: candle.end_time,
                        progress: progress(replay.anchor_ms, candle.end_time, wall_now),
                        speed,
                        state: SessionState::Running.as_str().to_string(),
                        simulation_time: sim_time,
                        ohlcv: candle,
                    };
                    if events.emit(OutboundMessage::SimulationUpdate(update)).is_err() {
                        return Drive::Fatal(None);
                    }
                }
                Ok(None) => {
                    debug!(period_start, "no vendor candle for closed period");
                }
                Err(e) => return Drive::Fatal(Some(e)),
            }
            replay.period_start += len;
            replay.aggregator.reset();
        }

        // Partial candle covering [period_start, sim_time).
        if sim_time > replay.period_start {
            let built = aggregate_with_retry(
                &mut replay.aggregator,
                &replay.symbol,
                replay.interval,
                replay.period_start,
                sim_time,
            )
            .await;
            match built {
                Ok(candle) => {
                    replay.last_price = Some(candle.close);
                    let update = SimulationUpdate {
                        price: candle.close,
                        timestamp: sim_time,
                        progress: progress(replay.anchor_ms, sim_time, wall_now),
                        speed,
                        state: SessionState::Running.as_str().to_string(),
                        simulation_time: sim_time,
                        ohlcv: candle,
                    };
                    if events.emit(OutboundMessage::SimulationUpdate(update)).is_err() {
                        return Drive::Fatal(None);
                    }
                }
                // The vendor has no sub-candle yet for this window; try again
                // next tick.
                Err(CoreError::InsufficientData) => {}
                Err(e) => return Drive::Fatal(Some(e)),
            }
        }

        Drive::Continue
    }
}

/// Fraction of the anchor→now span already replayed, clamped to [0, 1].
fn progress(anchor_ms: i64, sim_time: i64, wall_now: i64) -> f64 {
    let span = (wall_now - anchor_ms).max(1) as f64;
    ((sim_time - anchor_ms) as f64 / span).clamp(0.0, 1.0)
}

// ---------------------------------------------------------------------------
// Bounded vendor retries
// ---------------------------------------------------------------------------

async fn prime_with_retry(
    buffer: &mut ReplayBuffer,
    source: &dyn MarketDataSource,
) -> CoreResult<usize> {
    let mut attempt = 0;
    loop {
        match buffer.prime(source).await {
            Ok(n) => return Ok(n),
            Err(e) if e.is_retryable() && attempt < FETCH_BACKOFF.len() => {
                warn!(error = %e, attempt, "prime failed — backing off");
                sleep(FETCH_BACKOFF[attempt]).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn take_candle_with_retry(
    buffer: &mut ReplayBuffer,
    source: &dyn MarketDataSource,
    period_start: i64,
) -> CoreResult<Option<Candle>> {
    let mut attempt = 0;
    loop {
        match buffer.take_candle(source, period_start).await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt < FETCH_BACKOFF.len() => {
                warn!(error = %e, attempt, period_start, "buffer extension failed — backing off");
                sleep(FETCH_BACKOFF[attempt]).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn aggregate_with_retry(
    aggregator: &mut CandleAggregator,
    symbol: &str,
    interval: Interval,
    period_start: i64,
    cutoff: i64,
) -> CoreResult<Candle> {
    let mut attempt = 0;
    loop {
        match aggregator
            .incomplete_candle(symbol, interval, period_start, cutoff)
            .await
        {
            Ok(c) => return Ok(c),
            Err(e) if e.is_retryable() && attempt < FETCH_BACKOFF.len() => {
                warn!(error = %e, attempt, period_start, "aggregation fetch failed — backing off");
                sleep(FETCH_BACKOFF[attempt]).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Paced ticker task
// ---------------------------------------------------------------------------

/// Drive an engine until its session turns terminal or the close signal
/// fires. Spawned once per successful `Start`.
pub async fn run_ticker(
    engine: Arc<Mutex<SimulationEngine>>,
    tick_interval: Duration,
    mut close: watch::Receiver<CloseReason>,
) {
    loop {
        tokio::select! {
            _ = sleep(tick_interval) => {}
            _ = close.changed() => break,
        }
        if close.borrow().is_closing() {
            break;
        }
        if !engine.lock().await.tick().await {
            break;
        }
    }
    debug!("paced ticker exited");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
