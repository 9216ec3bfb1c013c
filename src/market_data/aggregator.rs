// =============================================================================
// Candle Aggregator — progressive incomplete-candle construction
// =============================================================================
//
// Builds the partial candle for the period enclosing the current simulated
// time by folding 1-minute sub-candles fetched from the vendor. Sub-candles
// already fetched for the current period are cached so that a 200 ms tick
// cadence does not re-page the same minutes; the cache is dropped on period
// rollover, timeframe change, or session teardown via [`reset`].
//
// [`reset`]: CandleAggregator::reset
// =============================================================================

use std::sync::Arc;

use tracing::debug;

use crate::error::{CoreError, CoreResult};
use crate::market_data::candle::{Candle, Interval};
use crate::market_data::source::{MarketDataSource, MAX_PAGE_LIMIT};

struct PeriodCache {
    symbol: String,
    interval: Interval,
    period_start: i64,
    /// 1-minute sub-candles fetched so far, ascending, all with
    /// `start_time ∈ [period_start, period_start + len)`.
    subs: Vec<Candle>,
}

pub struct CandleAggregator {
    source: Arc<dyn MarketDataSource>,
    cache: Option<PeriodCache>,
}

impl CandleAggregator {
    pub fn new(source: Arc<dyn MarketDataSource>) -> Self {
        Self {
            source,
            cache: None,
        }
    }

    /// Drop any cached sub-candles. The next build starts a fresh period.
    pub fn reset(&mut self) {
        self.cache = None;
    }

    /// Build the incomplete candle covering `[period_start, cutoff)` bucketed
    /// as `interval`.
    ///
    /// The result keeps the full period boundary: `start_time ==
    /// period_start`, `end_time == period_start + interval.len_ms()`,
    /// `is_complete == false`, while `close` is the close of the last
    /// sub-candle opening before `cutoff`.
    ///
    /// Fails with `InsufficientData` when no sub-candle opens inside the
    /// window.
    pub async fn incomplete_candle(
        &mut self,
        symbol: &str,
        interval: Interval,
        period_start: i64,
        cutoff: i64,
    ) -> CoreResult<Candle> {
        let period_end = period_start + interval.len_ms();
        if cutoff < period_start || cutoff >= period_end {
            return Err(CoreError::InvalidRequest(format!(
                "cutoff {cutoff} outside period [{period_start}, {period_end})"
            )));
        }

        // Invalidate the cache if it belongs to a different bucket.
        let stale = match &self.cache {
            Some(c) => {
                c.symbol != symbol || c.interval != interval || c.period_start != period_start
            }
            None => true,
        };
        if stale {
            self.cache = Some(PeriodCache {
                symbol: symbol.to_string(),
                interval,
                period_start,
                subs: Vec::new(),
            });
        }

        // Fetch any minutes that have come into view since the last build.
        let coverage = {
            let cache = self.cache.as_ref().expect("cache initialized above");
            cache.subs.last().map_or(period_start, |c| c.end_time)
        };
        if cutoff > coverage {
            self.fill(coverage, cutoff, period_end).await?;
        }

        let cache = self.cache.as_ref().expect("cache initialized above");
        fold_sub_candles(&cache.subs, period_start, period_end, cutoff)
    }

    /// Page 1-minute candles from `from` until coverage reaches `cutoff` or
    /// the vendor runs out of rows. Inter-page spacing comes from the
    /// source's own request throttle.
    async fn fill(&mut self, from: i64, cutoff: i64, period_end: i64) -> CoreResult<()> {
        let cache = self.cache.as_mut().expect("fill requires a cache");
        let mut next_start = from;

        loop {
            let page = self
                .source
                .fetch_candles(
                    &cache.symbol,
                    Interval::M1,
                    MAX_PAGE_LIMIT,
                    Some(next_start),
                    Some(period_end - 1),
                )
                .await?;

            let fetched = page.len();
            for candle in page {
                let newer = cache
                    .subs
                    .last()
                    .map_or(true, |last| candle.start_time >= last.end_time);
                if newer && candle.start_time < period_end {
                    cache.subs.push(candle);
                }
            }

            let coverage = cache.subs.last().map_or(next_start, |c| c.end_time);
            debug!(
                symbol = %cache.symbol,
                period_start = cache.period_start,
                coverage,
                cutoff,
                fetched,
                "aggregator page folded in"
            );

            if fetched < MAX_PAGE_LIMIT as usize || coverage >= cutoff {
                return Ok(());
            }
            next_start = coverage;
        }
    }
}

/// Fold the sub-candles opening before `cutoff` into one incomplete candle.
fn fold_sub_candles(
    subs: &[Candle],
    period_start: i64,
    period_end: i64,
    cutoff: i64,
) -> CoreResult<Candle> {
    let mut included = subs.iter().filter(|c| c.start_time < cutoff);

    let first = included.next().ok_or(CoreError::InsufficientData)?;
    let mut folded = Candle {
        start_time: period_start,
        end_time: period_end,
        open: first.open,
        high: first.high,
        low: first.low,
        close: first.close,
        volume: first.volume,
        is_complete: false,
    };

    for c in included {
        folded.high = folded.high.max(c.high);
        folded.low = folded.low.min(c.low);
        folded.close = c.close;
        folded.volume += c.volume;
    }

    Ok(folded)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

    /// Deterministic vendor: one 1m candle per minute since epoch, closing at
    /// `100 + minute_index`. `end_minute` bounds the data the vendor has, so
    /// tests can grow it mid-flight.
    struct MinuteVendor {
        calls: AtomicU32,
        end_minute: AtomicI64,
    }

    impl MinuteVendor {
        fn new() -> Arc<Self> {
            Self::until(i64::MAX / 60_000 - 1)
        }

        fn until(end_minute: i64) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                end_minute: AtomicI64::new(end_minute),
            })
        }

        fn candle_at(minute: i64) -> Candle {
            let start = minute * 60_000;
            let px = 100.0 + minute as f64;
            Candle {
                start_time: start,
                end_time: start + 60_000,
                open: px,
                high: px + 0.5,
                low: px - 0.5,
                close: px + 0.25,
                volume: 1.0,
                is_complete: true,
            }
        }
    }

    #[async_trait]
    impl MarketDataSource for MinuteVendor {
        async fn fetch_candles(
            &self,
            _symbol: &str,
            interval: Interval,
            limit: u32,
            start_time: Option<i64>,
            end_time: Option<i64>,
        ) -> CoreResult<Vec<Candle>> {
            assert_eq!(interval, Interval::M1);
            self.calls.fetch_add(1, Ordering::SeqCst);

            let from = start_time.unwrap_or(0) / 60_000;
            let to = end_time
                .map_or(i64::MAX / 60_000 - 1, |e| e / 60_000)
                .min(self.end_minute.load(Ordering::SeqCst) - 1);
            Ok((from..=to)
                .take(limit as usize)
                .map(Self::candle_at)
                .collect())
        }

        async fn earliest_available(&self, _symbol: &str) -> CoreResult<i64> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn folds_sub_candles_into_one_incomplete_bar() {
        let vendor = MinuteVendor::new();
        let mut agg = CandleAggregator::new(vendor.clone());

        // 5m period starting at minute 0, cutoff at 3.5 minutes in.
        let candle = agg
            .incomplete_candle("BTCUSDT", Interval::M5, 0, 210_000)
            .await
            .unwrap();

        // Minutes 0..=3 open before the cutoff.
        assert_eq!(candle.start_time, 0);
        assert_eq!(candle.end_time, 300_000);
        assert!(!candle.is_complete);
        assert_eq!(candle.open, 100.0);
        assert_eq!(candle.close, 103.25);
        assert_eq!(candle.high, 103.5);
        assert_eq!(candle.low, 99.5);
        assert_eq!(candle.volume, 4.0);
    }

    #[tokio::test]
    async fn cached_coverage_is_not_refetched() {
        // The vendor only has minutes 0 and 1 to begin with.
        let vendor = MinuteVendor::until(2);
        let mut agg = CandleAggregator::new(vendor.clone());

        let first = agg
            .incomplete_candle("BTCUSDT", Interval::M15, 0, 120_000)
            .await
            .unwrap();
        assert_eq!(first.volume, 2.0);
        let after_first = vendor.calls.load(Ordering::SeqCst);

        // Cutoff still inside covered minutes: the cache answers alone.
        agg.incomplete_candle("BTCUSDT", Interval::M15, 0, 120_000)
            .await
            .unwrap();
        assert_eq!(vendor.calls.load(Ordering::SeqCst), after_first);

        // More history appears and the cutoff moves past coverage: exactly
        // one more page is pulled and folded on top of the cached minutes.
        vendor.end_minute.store(5, Ordering::SeqCst);
        let grown = agg
            .incomplete_candle("BTCUSDT", Interval::M15, 0, 250_000)
            .await
            .unwrap();
        assert_eq!(vendor.calls.load(Ordering::SeqCst), after_first + 1);
        assert_eq!(grown.volume, 5.0);
        assert_eq!(grown.open, 100.0);
        assert_eq!(grown.close, 104.25);
    }

    #[tokio::test]
    async fn period_change_invalidates_the_cache() {
        let vendor = MinuteVendor::new();
        let mut agg = CandleAggregator::new(vendor.clone());

        let a = agg
            .incomplete_candle("BTCUSDT", Interval::M5, 0, 120_000)
            .await
            .unwrap();
        let b = agg
            .incomplete_candle("BTCUSDT", Interval::M5, 300_000, 360_500)
            .await
            .unwrap();

        assert_eq!(a.start_time, 0);
        assert_eq!(b.start_time, 300_000);
        assert_eq!(b.open, 105.0); // minute 5 opens the new period
    }

    #[tokio::test]
    async fn cutoff_at_period_start_has_no_data() {
        let vendor = MinuteVendor::new();
        let mut agg = CandleAggregator::new(vendor.clone());

        // An empty window folds nothing.
        struct EmptyVendor;
        #[async_trait]
        impl MarketDataSource for EmptyVendor {
            async fn fetch_candles(
                &self,
                _: &str,
                _: Interval,
                _: u32,
                _: Option<i64>,
                _: Option<i64>,
            ) -> CoreResult<Vec<Candle>> {
                Ok(Vec::new())
            }
            async fn earliest_available(&self, _: &str) -> CoreResult<i64> {
                Err(CoreError::InsufficientData)
            }
        }

        let mut empty = CandleAggregator::new(Arc::new(EmptyVendor));
        let err = empty
            .incomplete_candle("BTCUSDT", Interval::M5, 0, 60_000)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InsufficientData));

        // Out-of-period cutoff is rejected outright.
        let err = agg
            .incomplete_candle("BTCUSDT", Interval::M5, 0, 300_000)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidRequest(_)));
    }
}
