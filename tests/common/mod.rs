// Shared fixtures for the integration tests: a deterministic vendor and a
// pre-wired engine/executor pair over a temp-file store.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, watch, Mutex};

use replay_exchange::api::protocol::{OutboundMessage, StartRequest};
use replay_exchange::error::CoreResult;
use replay_exchange::execution::OrderExecutor;
use replay_exchange::market_data::candle::{Candle, Interval};
use replay_exchange::market_data::source::MarketDataSource;
use replay_exchange::persistence::Database;
use replay_exchange::replay::engine::{CloseReason, EventSink, SimulationEngine};

/// Deterministic vendor: for every interval, a complete candle exists for
/// each period fully closed before "now". The close of the N-th 1m candle is
/// `BASE_PRICE + (N % 1000)`, so prices are stable across intervals and runs.
pub struct StubVendor {
    pub calls: AtomicU32,
}

pub const BASE_PRICE: f64 = 50_000.0;

impl StubVendor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
        })
    }

    pub fn candle_at(interval: Interval, start: i64) -> Candle {
        let idx = (start / 60_000) % 1000;
        let px = BASE_PRICE + idx as f64;
        Candle {
            start_time: start,
            end_time: start + interval.len_ms(),
            open: px,
            high: px + 2.0,
            low: px - 2.0,
            close: px + 1.0,
            volume: 1.5,
            is_complete: true,
        }
    }
}

#[async_trait]
impl MarketDataSource for StubVendor {
    async fn fetch_candles(
        &self,
        _symbol: &str,
        interval: Interval,
        limit: u32,
        start_time: Option<i64>,
        end_time: Option<i64>,
    ) -> CoreResult<Vec<Candle>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let len = interval.len_ms();
        let now = Utc::now().timestamp_millis();
        // Complete candles only; the end filter applies to open times.
        let open_cap = end_time.unwrap_or(i64::MAX);

        let mut t = interval.align(start_time.unwrap_or(0));
        let mut out = Vec::new();
        while t + len <= now && t <= open_cap && out.len() < limit as usize {
            out.push(Self::candle_at(interval, t));
            t += len;
        }
        Ok(out)
    }

    async fn earliest_available(&self, _symbol: &str) -> CoreResult<i64> {
        Ok(0)
    }
}

/// Everything a scripted session needs, plus the temp dir keeping the store
/// alive for the test's duration.
pub struct Session {
    pub engine: Arc<Mutex<SimulationEngine>>,
    pub executor: OrderExecutor,
    pub db: Database,
    pub events: mpsc::Receiver<OutboundMessage>,
    pub vendor: Arc<StubVendor>,
    _dir: tempfile::TempDir,
}

pub fn session() -> Session {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("replay.db");
    let db = Database::open(path.to_str().unwrap()).unwrap();

    let (tx, rx) = mpsc::channel(256);
    let (close_tx, _close_rx) = watch::channel(CloseReason::Open);
    let sink = EventSink::new(tx, Arc::new(close_tx));
    let vendor = StubVendor::new();
    let engine = SimulationEngine::new(vendor.clone(), db.clone(), sink);

    Session {
        engine: Arc::new(Mutex::new(engine)),
        executor: OrderExecutor::new(db.clone()),
        db,
        events: rx,
        vendor,
        _dir: dir,
    }
}

/// Anchor `offset_ms` into a 5m period roughly an hour back from now.
pub fn recent_anchor(offset_ms: i64) -> i64 {
    let now = Utc::now().timestamp_millis();
    Interval::M5.align(now - 3_600_000) + offset_ms
}

pub fn start_request(anchor: i64, speed: u32, funding: f64) -> StartRequest {
    StartRequest {
        symbol: "BTCUSDT".into(),
        start_time: anchor,
        interval: Interval::M5,
        speed,
        initial_funding: funding,
    }
}

pub fn drain(rx: &mut mpsc::Receiver<OutboundMessage>) -> Vec<OutboundMessage> {
    let mut out = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        out.push(msg);
    }
    out
}
