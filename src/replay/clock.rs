// =============================================================================
// Session Clock — converts real elapsed time into simulated time
// =============================================================================
//
// Simulated time advances by `realΔt × speed` on every call to `advance`.
// The clock carries fractional milliseconds internally so that repeated
// 200 ms ticks at high speed multipliers accumulate no truncation drift.
//
// While paused the reference instant is dropped entirely; `resume` re-arms it
// at the current instant, so wall time spent paused never leaks into the
// simulation.
// =============================================================================

use tokio::time::Instant;

pub struct SessionClock {
    /// Simulated time in milliseconds, fractional to avoid per-tick rounding.
    sim_time_ms: f64,
    speed: u32,
    /// Reference instant of the last advance. `None` while paused.
    last_real_tick: Option<Instant>,
}

impl SessionClock {
    /// Start a running clock at `anchor_ms` with the given speed multiplier.
    pub fn new(anchor_ms: i64, speed: u32) -> Self {
        Self {
            sim_time_ms: anchor_ms as f64,
            speed,
            last_real_tick: Some(Instant::now()),
        }
    }

    /// Advance simulated time by the real time elapsed since the previous
    /// advance, scaled by the speed multiplier. A no-op while paused.
    pub fn advance(&mut self) -> i64 {
        if let Some(last) = self.last_real_tick {
            let now = Instant::now();
            let real_ms = (now - last).as_secs_f64() * 1000.0;
            self.sim_time_ms += real_ms * self.speed as f64;
            self.last_real_tick = Some(now);
        }
        self.sim_time()
    }

    /// Freeze the clock. Elapsed real time up to this instant is banked into
    /// `sim_time` first; the reference instant is then dropped.
    pub fn pause(&mut self) {
        self.advance();
        self.last_real_tick = None;
    }

    /// Unfreeze without advancing: the reference instant restarts now.
    pub fn resume(&mut self) {
        if self.last_real_tick.is_none() {
            self.last_real_tick = Some(Instant::now());
        }
    }

    /// Change the speed multiplier. Takes effect from this instant onward;
    /// time already elapsed is banked at the old speed first so the change
    /// never jumps `sim_time`.
    pub fn set_speed(&mut self, speed: u32) {
        if self.last_real_tick.is_some() {
            self.advance();
        }
        self.speed = speed;
    }

    pub fn sim_time(&self) -> i64 {
        self.sim_time_ms as i64
    }

    pub fn speed(&self) -> u32 {
        self.speed
    }

    pub fn is_paused(&self) -> bool {
        self.last_real_tick.is_none()
    }
}

impl std::fmt::Debug for SessionClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionClock")
            .field("sim_time_ms", &self.sim_time())
            .field("speed", &self.speed)
            .field("paused", &self.is_paused())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
