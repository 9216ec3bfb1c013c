// =============================================================================
// Vendor REST client — Binance public klines API
// =============================================================================
//
// Only the two public market-data endpoints the replay core needs are
// implemented: the klines range query and the earliest-available probe (a
// one-row klines query anchored at epoch). No signed endpoints, no API keys.
//
// Every request passes through the process-wide [`Throttle`] before it leaves
// the process, and the HTTP client carries a 30 s deadline after which an
// in-flight call surfaces as `VendorUnavailable`.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use crate::error::{CoreError, CoreResult};
use crate::market_data::candle::{Candle, Interval};
use crate::market_data::source::{MarketDataSource, MAX_PAGE_LIMIT};
use crate::market_data::throttle::Throttle;

/// Deadline for any single vendor request.
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

pub struct VendorClient {
    base_url: String,
    client: reqwest::Client,
    throttle: Arc<Throttle>,
}

impl VendorClient {
    pub fn new(base_url: impl Into<String>, throttle: Arc<Throttle>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");

        Self {
            base_url: base_url.into(),
            client,
            throttle,
        }
    }

    // -------------------------------------------------------------------------
    // Request plumbing
    // -------------------------------------------------------------------------

    /// Issue a throttled GET and classify the outcome into the core error
    /// taxonomy: transport problems and 5xx are `VendorUnavailable`, 429 is
    /// `RateLimited`, any other 4xx is `VendorRejected`.
    async fn get_json(&self, url: &str) -> CoreResult<serde_json::Value> {
        self.throttle.acquire().await;

        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| CoreError::VendorUnavailable(format!("request failed: {e}")))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| CoreError::VendorUnavailable(format!("invalid response body: {e}")))?;

        if status.as_u16() == 429 {
            warn!(url, "vendor rate limit hit");
            return Err(CoreError::RateLimited);
        }
        if status.is_client_error() {
            return Err(CoreError::VendorRejected(format!("{status}: {body}")));
        }
        if !status.is_success() {
            return Err(CoreError::VendorUnavailable(format!("{status}: {body}")));
        }

        Ok(body)
    }

    /// Parse a JSON value that may be either a string or a number into `f64`.
    /// The vendor encodes all kline decimals as strings.
    fn parse_str_f64(val: &serde_json::Value, name: &str) -> CoreResult<f64> {
        if let Some(s) = val.as_str() {
            s.parse::<f64>().map_err(|_| {
                CoreError::VendorUnavailable(format!("malformed decimal in field {name}: {s}"))
            })
        } else if let Some(n) = val.as_f64() {
            Ok(n)
        } else {
            Err(CoreError::VendorUnavailable(format!(
                "field {name} has unexpected JSON type: {val}"
            )))
        }
    }

    /// Parse one kline row (array-of-arrays response format).
    ///
    /// Array indices:
    ///   [0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume,
    ///   [6] closeTime, ... (remaining fields unused here)
    fn parse_kline_row(row: &serde_json::Value, interval: Interval) -> CoreResult<Candle> {
        let arr = row
            .as_array()
            .ok_or_else(|| CoreError::VendorUnavailable("kline entry is not an array".into()))?;

        if arr.len() < 7 {
            return Err(CoreError::VendorUnavailable(format!(
                "kline entry has only {} elements",
                arr.len()
            )));
        }

        let start_time = arr[0]
            .as_i64()
            .ok_or_else(|| CoreError::VendorUnavailable("missing kline open time".into()))?;

        Ok(Candle {
            start_time,
            end_time: start_time + interval.len_ms(),
            open: Self::parse_str_f64(&arr[1], "open")?,
            high: Self::parse_str_f64(&arr[2], "high")?,
            low: Self::parse_str_f64(&arr[3], "low")?,
            close: Self::parse_str_f64(&arr[4], "close")?,
            volume: Self::parse_str_f64(&arr[5], "volume")?,
            is_complete: true,
        })
    }
}

#[async_trait]
impl MarketDataSource for VendorClient {
    /// GET /api/v3/klines.
    #[instrument(skip(self), name = "vendor::fetch_candles")]
    async fn fetch_candles(
        &self,
        symbol: &str,
        interval: Interval,
        limit: u32,
        start_time: Option<i64>,
        end_time: Option<i64>,
    ) -> CoreResult<Vec<Candle>> {
        let limit = limit.min(MAX_PAGE_LIMIT);
        let mut url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.base_url, symbol, interval, limit
        );
        if let Some(st) = start_time {
            url.push_str(&format!("&startTime={st}"));
        }
        if let Some(et) = end_time {
            url.push_str(&format!("&endTime={et}"));
        }

        let body = self.get_json(&url).await?;
        let raw = body
            .as_array()
            .ok_or_else(|| CoreError::VendorUnavailable("klines response is not an array".into()))?;

        let mut candles = Vec::with_capacity(raw.len());
        for entry in raw {
            candles.push(Self::parse_kline_row(entry, interval)?);
        }

        debug!(symbol, %interval, count = candles.len(), "candles fetched");
        Ok(candles)
    }

    /// Open time of the first candle the vendor has, probed with a one-row
    /// klines query anchored at epoch.
    #[instrument(skip(self), name = "vendor::earliest_available")]
    async fn earliest_available(&self, symbol: &str) -> CoreResult<i64> {
        let candles = self
            .fetch_candles(symbol, Interval::M1, 1, Some(0), None)
            .await?;

        let first = candles.first().ok_or(CoreError::InsufficientData)?;
        debug!(symbol, earliest = first.start_time, "earliest timestamp probed");
        Ok(first.start_time)
    }
}

impl std::fmt::Debug for VendorClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VendorClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_kline_row_ok() {
        let row = serde_json::json!([
            1_700_000_000_000_i64,
            "37000.00",
            "37050.00",
            "36990.00",
            "37020.00",
            "123.456",
            1_700_000_059_999_i64,
            "4567890.12",
            1500,
            "60.123",
            "2224455.66"
        ]);
        let candle = VendorClient::parse_kline_row(&row, Interval::M1).expect("should parse");
        assert_eq!(candle.start_time, 1_700_000_000_000);
        assert_eq!(candle.end_time, 1_700_000_060_000);
        assert!((candle.close - 37020.0).abs() < f64::EPSILON);
        assert!(candle.is_complete);
    }

    #[test]
    fn parse_kline_row_rejects_short_rows() {
        let row = serde_json::json!([1_700_000_000_000_i64, "1.0"]);
        assert!(VendorClient::parse_kline_row(&row, Interval::M1).is_err());
    }

    #[test]
    fn parse_str_f64_accepts_both_encodings() {
        assert_eq!(
            VendorClient::parse_str_f64(&serde_json::json!("42.5"), "x").unwrap(),
            42.5
        );
        assert_eq!(
            VendorClient::parse_str_f64(&serde_json::json!(42.5), "x").unwrap(),
            42.5
        );
        assert!(VendorClient::parse_str_f64(&serde_json::json!(null), "x").is_err());
    }
}
