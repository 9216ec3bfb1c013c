// =============================================================================
// Vendor request throttle — process-wide minimum inter-request spacing
// =============================================================================
//
// The vendor tolerates at most 10 requests per second from one deployment, so
// every outbound call first acquires this gate. It is a single-holder lock:
// the waiter that owns the inner mutex sleeps out the remaining spacing while
// holding it, which serializes all callers and spaces requests by at least
// `min_interval` without any free-running global counters.
// =============================================================================

use tokio::sync::Mutex;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::trace;

/// Default spacing between vendor requests (10 req/s process-wide).
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_millis(100);

pub struct Throttle {
    last_request: Mutex<Option<Instant>>,
    min_interval: Duration,
}

impl Throttle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            last_request: Mutex::new(None),
            min_interval,
        }
    }

    /// Block until the caller may issue the next vendor request.
    ///
    /// Returns only once at least `min_interval` has elapsed since the
    /// previous acquisition; the permit is consumed by returning.
    pub async fn acquire(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let due = prev + self.min_interval;
            let now = Instant::now();
            if now < due {
                trace!(wait_ms = (due - now).as_millis() as u64, "throttling vendor request");
                sleep_until(due).await;
            }
        }
        *last = Some(Instant::now());
    }
}

impl Default for Throttle {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_INTERVAL)
    }
}

impl std::fmt::Debug for Throttle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Throttle")
            .field("min_interval", &self.min_interval)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
