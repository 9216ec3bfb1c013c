// =============================================================================
// Candle and aggregation-interval types
// =============================================================================

use serde::{Deserialize, Serialize};

/// A single OHLCV bar.
///
/// `end_time` is exclusive and always equals `start_time +
/// interval.len_ms()`, including for an incomplete candle: the bar keeps the
/// boundary of its enclosing period while `close` tracks the last observed
/// sub-candle close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candle {
    pub start_time: i64,
    pub end_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub is_complete: bool,
}

// ---------------------------------------------------------------------------
// Interval
// ---------------------------------------------------------------------------

const MINUTE_MS: i64 = 60_000;
const HOUR_MS: i64 = 60 * MINUTE_MS;
const DAY_MS: i64 = 24 * HOUR_MS;

/// Aggregation width of a candle series.
///
/// Lengths are fixed nominal durations (`1w` = 7 days, `1M` = 30 days) so
/// that period arithmetic stays constant-width; alignment is an epoch floor
/// by that length, matching how the vendor buckets its own series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interval {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "3m")]
    M3,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "2h")]
    H2,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "6h")]
    H6,
    #[serde(rename = "8h")]
    H8,
    #[serde(rename = "12h")]
    H12,
    #[serde(rename = "1d")]
    D1,
    #[serde(rename = "3d")]
    D3,
    #[serde(rename = "1w")]
    W1,
    #[serde(rename = "1M")]
    Mo1,
}

impl Interval {
    /// Length of one period in milliseconds.
    pub fn len_ms(&self) -> i64 {
        match self {
            Self::M1 => MINUTE_MS,
            Self::M3 => 3 * MINUTE_MS,
            Self::M5 => 5 * MINUTE_MS,
            Self::M15 => 15 * MINUTE_MS,
            Self::M30 => 30 * MINUTE_MS,
            Self::H1 => HOUR_MS,
            Self::H2 => 2 * HOUR_MS,
            Self::H4 => 4 * HOUR_MS,
            Self::H6 => 6 * HOUR_MS,
            Self::H8 => 8 * HOUR_MS,
            Self::H12 => 12 * HOUR_MS,
            Self::D1 => DAY_MS,
            Self::D3 => 3 * DAY_MS,
            Self::W1 => 7 * DAY_MS,
            Self::Mo1 => 30 * DAY_MS,
        }
    }

    /// Floor `ts_ms` to the start of its enclosing period.
    pub fn align(&self, ts_ms: i64) -> i64 {
        let len = self.len_ms();
        ts_ms.div_euclid(len) * len
    }

    /// Vendor wire name ("1m", "4h", "1M", ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M3 => "3m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H2 => "2h",
            Self::H4 => "4h",
            Self::H6 => "6h",
            Self::H8 => "8h",
            Self::H12 => "12h",
            Self::D1 => "1d",
            Self::D3 => "3d",
            Self::W1 => "1w",
            Self::Mo1 => "1M",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "1m" => Some(Self::M1),
            "3m" => Some(Self::M3),
            "5m" => Some(Self::M5),
            "15m" => Some(Self::M15),
            "30m" => Some(Self::M30),
            "1h" => Some(Self::H1),
            "2h" => Some(Self::H2),
            "4h" => Some(Self::H4),
            "6h" => Some(Self::H6),
            "8h" => Some(Self::H8),
            "12h" => Some(Self::H12),
            "1d" => Some(Self::D1),
            "3d" => Some(Self::D3),
            "1w" => Some(Self::W1),
            "1M" => Some(Self::Mo1),
            _ => None,
        }
    }

    /// All recognized intervals, smallest first.
    pub fn all() -> &'static [Interval] {
        &[
            Self::M1,
            Self::M3,
            Self::M5,
            Self::M15,
            Self::M30,
            Self::H1,
            Self::H2,
            Self::H4,
            Self::H6,
            Self::H8,
            Self::H12,
            Self::D1,
            Self::D3,
            Self::W1,
            Self::Mo1,
        ]
    }
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_interval_round_trips_through_str() {
        for iv in Interval::all() {
            assert_eq!(Interval::from_str(iv.as_str()), Some(*iv));
        }
        assert_eq!(Interval::from_str("2m"), None);
        // Month is uppercase; minute is lowercase.
        assert_eq!(Interval::from_str("1M"), Some(Interval::Mo1));
        assert_eq!(Interval::from_str("1m"), Some(Interval::M1));
    }

    #[test]
    fn align_floors_to_period_start() {
        // 2024-08-27T06:02:00Z = 1724738520000
        let ts = 1_724_738_520_000;
        assert_eq!(Interval::M5.align(ts), 1_724_738_400_000); // 06:00:00
        assert_eq!(Interval::M1.align(ts), ts);
        assert_eq!(Interval::H1.align(ts), 1_724_738_400_000); // 06:00:00
    }

    #[test]
    fn align_is_idempotent() {
        for iv in Interval::all() {
            let aligned = iv.align(1_700_000_123_456);
            assert_eq!(iv.align(aligned), aligned);
            assert_eq!(aligned % iv.len_ms(), 0);
        }
    }

    #[test]
    fn candle_serializes_camel_case() {
        let c = Candle {
            start_time: 0,
            end_time: 300_000,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 10.0,
            is_complete: false,
        };
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["startTime"], 0);
        assert_eq!(json["endTime"], 300_000);
        assert_eq!(json["isComplete"], false);
    }
}
