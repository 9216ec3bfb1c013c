// =============================================================================
// Replay Buffer — paged, ordered sequence of complete candles
// =============================================================================
//
// Holds the complete candles of the session's interval from the anchor period
// forward. Candles are consumed in period order as simulated time crosses
// period boundaries; when the buffer runs dry it pulls the next vendor page
// from its cursor. A timeframe change rebuilds the buffer on the new grid.
// =============================================================================

use std::collections::VecDeque;

use tracing::debug;

use crate::error::CoreResult;
use crate::market_data::candle::{Candle, Interval};
use crate::market_data::source::{MarketDataSource, MAX_PAGE_LIMIT};

pub struct ReplayBuffer {
    symbol: String,
    interval: Interval,
    candles: VecDeque<Candle>,
    /// Open time from which the next vendor page is requested.
    next_fetch_start: i64,
}

impl ReplayBuffer {
    /// Create an empty buffer whose first fetch starts at the period
    /// enclosing `from_ms`.
    pub fn new(symbol: impl Into<String>, interval: Interval, from_ms: i64) -> Self {
        Self {
            symbol: symbol.into(),
            interval,
            candles: VecDeque::new(),
            next_fetch_start: interval.align(from_ms),
        }
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    /// Fetch the first page so the session starts with data on hand.
    pub async fn prime(&mut self, source: &dyn MarketDataSource) -> CoreResult<usize> {
        self.extend(source).await
    }

    /// Take the complete candle for the period opening at `period_start`,
    /// fetching more pages on demand.
    ///
    /// Candles for earlier periods are discarded (already consumed or
    /// skipped by a timeframe change). Returns `Ok(None)` when the vendor has
    /// no candle for that period yet — the caller moves on and retries the
    /// next period.
    pub async fn take_candle(
        &mut self,
        source: &dyn MarketDataSource,
        period_start: i64,
    ) -> CoreResult<Option<Candle>> {
        loop {
            while let Some(front) = self.candles.front() {
                if front.start_time < period_start {
                    self.candles.pop_front();
                } else {
                    break;
                }
            }

            match self.candles.front() {
                Some(front) if front.start_time == period_start => {
                    return Ok(self.candles.pop_front());
                }
                Some(front) => {
                    // Gap in the vendor series; nothing to emit this period.
                    debug!(
                        symbol = %self.symbol,
                        period_start,
                        next_available = front.start_time,
                        "no candle for period"
                    );
                    return Ok(None);
                }
                None => {
                    if self.extend(source).await? == 0 {
                        // Vendor has nothing past the cursor yet.
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Rebuild the buffer on a new interval grid starting at the period
    /// enclosing `from_ms`.
    pub fn realign(&mut self, interval: Interval, from_ms: i64) {
        self.interval = interval;
        self.candles.clear();
        self.next_fetch_start = interval.align(from_ms);
        debug!(
            symbol = %self.symbol,
            interval = %interval,
            next_fetch_start = self.next_fetch_start,
            "replay buffer realigned"
        );
    }

    /// Pull one vendor page from the cursor and append the new candles.
    async fn extend(&mut self, source: &dyn MarketDataSource) -> CoreResult<usize> {
        let page = source
            .fetch_candles(
                &self.symbol,
                self.interval,
                MAX_PAGE_LIMIT,
                Some(self.next_fetch_start),
                None,
            )
            .await?;

        let mut appended = 0;
        for candle in page {
            if !candle.is_complete || candle.start_time < self.next_fetch_start {
                continue;
            }
            self.next_fetch_start = candle.end_time;
            self.candles.push_back(candle);
            appended += 1;
        }

        debug!(
            symbol = %self.symbol,
            interval = %self.interval,
            appended,
            buffered = self.candles.len(),
            "replay buffer extended"
        );
        Ok(appended)
    }
}

impl std::fmt::Debug for ReplayBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayBuffer")
            .field("symbol", &self.symbol)
            .field("interval", &self.interval)
            .field("buffered", &self.candles.len())
            .field("next_fetch_start", &self.next_fetch_start)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreResult;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Vendor serving 5m candles for minutes [0, limit_minutes), paged.
    struct PagedVendor {
        end_ms: i64,
        calls: AtomicU32,
    }

    impl PagedVendor {
        fn candle_at(interval: Interval, start: i64) -> Candle {
            let idx = (start / interval.len_ms()) as f64;
            Candle {
                start_time: start,
                end_time: start + interval.len_ms(),
                open: idx,
                high: idx + 1.0,
                low: idx - 1.0,
                close: idx + 0.5,
                volume: 2.0,
                is_complete: true,
            }
        }
    }

    #[async_trait]
    impl MarketDataSource for PagedVendor {
        async fn fetch_candles(
            &self,
            _symbol: &str,
            interval: Interval,
            limit: u32,
            start_time: Option<i64>,
            _end_time: Option<i64>,
        ) -> CoreResult<Vec<Candle>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let len = interval.len_ms();
            let mut out = Vec::new();
            let mut t = interval.align(start_time.unwrap_or(0));
            while t + len <= self.end_ms && out.len() < limit as usize {
                out.push(Self::candle_at(interval, t));
                t += len;
            }
            Ok(out)
        }

        async fn earliest_available(&self, _symbol: &str) -> CoreResult<i64> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn takes_candles_in_period_order() {
        let vendor = PagedVendor {
            end_ms: 3_000_000,
            calls: AtomicU32::new(0),
        };
        let mut buf = ReplayBuffer::new("BTCUSDT", Interval::M5, 0);

        let c0 = buf.take_candle(&vendor, 0).await.unwrap().unwrap();
        let c1 = buf.take_candle(&vendor, 300_000).await.unwrap().unwrap();
        assert_eq!(c0.start_time, 0);
        assert_eq!(c1.start_time, 300_000);
        assert!(c1.is_complete);
    }

    #[tokio::test]
    async fn skipping_ahead_discards_older_candles() {
        let vendor = PagedVendor {
            end_ms: 3_000_000,
            calls: AtomicU32::new(0),
        };
        let mut buf = ReplayBuffer::new("BTCUSDT", Interval::M5, 0);

        let c = buf.take_candle(&vendor, 900_000).await.unwrap().unwrap();
        assert_eq!(c.start_time, 900_000);
        // Earlier periods are gone.
        assert!(buf.candles.front().unwrap().start_time > 900_000);
    }

    #[tokio::test]
    async fn exhausted_vendor_yields_none_then_recovers() {
        let vendor = PagedVendor {
            end_ms: 600_000, // only two 5m candles exist
            calls: AtomicU32::new(0),
        };
        let mut buf = ReplayBuffer::new("BTCUSDT", Interval::M5, 0);

        assert!(buf.take_candle(&vendor, 0).await.unwrap().is_some());
        assert!(buf.take_candle(&vendor, 300_000).await.unwrap().is_some());
        assert!(buf.take_candle(&vendor, 600_000).await.unwrap().is_none());

        // More history appears (vendor caught up); the same period resolves.
        let vendor = PagedVendor {
            end_ms: 1_200_000,
            calls: AtomicU32::new(0),
        };
        let c = buf.take_candle(&vendor, 600_000).await.unwrap().unwrap();
        assert_eq!(c.start_time, 600_000);
    }

    #[tokio::test]
    async fn realign_switches_interval_grid() {
        let vendor = PagedVendor {
            end_ms: 10_000_000,
            calls: AtomicU32::new(0),
        };
        let mut buf = ReplayBuffer::new("BTCUSDT", Interval::M5, 0);
        buf.take_candle(&vendor, 0).await.unwrap().unwrap();

        // 07:00-ish timestamp lands mid-15m-period; grid realigns under it.
        buf.realign(Interval::M15, 1_000_000);
        assert_eq!(buf.len(), 0);
        let c = buf.take_candle(&vendor, 900_000).await.unwrap().unwrap();
        assert_eq!(c.start_time, 900_000);
        assert_eq!(c.end_time, 1_800_000);
    }
}
