// =============================================================================
// Market-data source trait — the seam between the engine and the vendor
// =============================================================================

use async_trait::async_trait;

use crate::error::CoreResult;
use crate::market_data::candle::{Candle, Interval};

/// Largest candle page a single request may return.
pub const MAX_PAGE_LIMIT: u32 = 1000;

/// The two operations the core needs from the historical-data vendor.
///
/// Implementations must return candles that are complete, strictly
/// time-ordered, and aligned to interval boundaries. The replay engine and
/// the aggregator only ever talk to this trait, which is what lets the test
/// suite substitute a deterministic in-memory vendor.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Fetch up to `limit` candles (capped at [`MAX_PAGE_LIMIT`]) for
    /// `symbol` at `interval`, optionally bounded by `start_time` /
    /// `end_time` (both ms, inclusive of candles opening at `start_time`).
    async fn fetch_candles(
        &self,
        symbol: &str,
        interval: Interval,
        limit: u32,
        start_time: Option<i64>,
        end_time: Option<i64>,
    ) -> CoreResult<Vec<Candle>>;

    /// Open time (ms) of the oldest candle the vendor has for `symbol`.
    async fn earliest_available(&self, symbol: &str) -> CoreResult<i64>;
}
