// =============================================================================
// Shared types used across the replay exchange
// =============================================================================

use serde::{Deserialize, Serialize};

/// The quote asset every symbol is denominated in. A position in this asset
/// represents the session's cash balance.
pub const QUOTE_CURRENCY: &str = "USDT";

/// Symbols the vendor adapter is allowed to request.
pub const SUPPORTED_SYMBOLS: &[&str] = &["BTCUSDT", "ETHUSDT"];

/// Replay speed multipliers a client may request. Anything outside this set
/// is rejected at `Start` / `SetSpeed` time.
pub const RECOGNIZED_SPEEDS: &[u32] = &[1, 5, 10, 30, 60, 120, 300, 600, 1440];

/// Flat taker fee applied to every market order (10 bps of notional).
pub const FEE_RATE: f64 = 0.001;

/// The fixed user identity every session runs under.
pub const DEFAULT_USER_ID: i64 = 1;

/// Return `true` if `symbol` is one of the pairs the engine serves.
pub fn is_supported_symbol(symbol: &str) -> bool {
    SUPPORTED_SYMBOLS.contains(&symbol)
}

/// Return `true` if `speed` is a recognized replay multiplier.
pub fn is_recognized_speed(speed: u32) -> bool {
    RECOGNIZED_SPEEDS.contains(&speed)
}

// ---------------------------------------------------------------------------
// Order side
// ---------------------------------------------------------------------------

/// Direction of a market order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "buy" => Some(Self::Buy),
            "sell" => Some(Self::Sell),
            _ => None,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Order status
// ---------------------------------------------------------------------------

/// Lifecycle status of an order row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Executed,
    Failed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Executed => "executed",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "executed" => Some(Self::Executed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Simulation status
// ---------------------------------------------------------------------------

/// Persisted status of a simulation record. The in-memory session state
/// machine additionally has an `Idle` state that never reaches the store
/// (a record is only created on `Start`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimulationStatus {
    Running,
    Paused,
    Stopped,
    Completed,
}

impl SimulationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "stopped" => Some(Self::Stopped),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }

    /// Stopped and Completed are terminal; no transition leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Completed)
    }
}

impl std::fmt::Display for SimulationStatus {
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
    fn side_round_trips_through_str() {
        assert_eq!(Side::from_str("buy"), Some(Side::Buy));
        assert_eq!(Side::from_str("sell"), Some(Side::Sell));
        assert_eq!(Side::from_str("BUY"), None);
        assert_eq!(Side::Buy.as_str(), "buy");
    }

    #[test]
    fn simulation_status_terminality() {
        assert!(!SimulationStatus::Running.is_terminal());
        assert!(!SimulationStatus::Paused.is_terminal());
        assert!(SimulationStatus::Stopped.is_terminal());
        assert!(SimulationStatus::Completed.is_terminal());
    }

    #[test]
    fn recognized_speed_set() {
        assert!(is_recognized_speed(1));
        assert!(is_recognized_speed(60));
        assert!(!is_recognized_speed(0));
        assert!(!is_recognized_speed(7));
    }
}
