// =============================================================================
// Core error taxonomy
// =============================================================================
//
// Every failure the engine can surface to a client or log maps to exactly one
// variant here. The `kind()` string is part of the wire protocol: it appears
// in `simulation_control_error` / `order_control_error` / `error` frames and
// must stay stable.
// =============================================================================

use thiserror::Error;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    /// Malformed frame, unknown message type, or an out-of-range parameter
    /// (interval, symbol, quantity, funding, anchor in the future).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// `Start` received while the session already owns a simulation.
    #[error("a simulation is already active on this session")]
    AlreadyRunning,

    /// Speed multiplier outside the recognized set.
    #[error("unrecognized speed multiplier: {0}")]
    InvalidSpeed(u32),

    /// Buy order notional (plus fee) exceeds the cash position.
    #[error("insufficient funds: required {required:.8}, available {available:.8}")]
    InsufficientFunds { required: f64, available: f64 },

    /// Sell order quantity exceeds the base-asset position.
    #[error("insufficient holdings: required {required:.8}, available {available:.8}")]
    InsufficientHoldings { required: f64, available: f64 },

    /// The vendor returned no candles for the requested range.
    #[error("no market data available for the requested range")]
    InsufficientData,

    /// Transport failure or vendor 5xx. Retryable.
    #[error("vendor unavailable: {0}")]
    VendorUnavailable(String),

    /// Vendor 4xx (including unknown symbol). Retryable at the caller's
    /// discretion but usually a hard failure.
    #[error("vendor rejected request: {0}")]
    VendorRejected(String),

    /// Vendor 429 or local request budget exhausted. Always retryable after
    /// backoff.
    #[error("vendor request budget exhausted")]
    RateLimited,

    /// A store read or transaction failed and was rolled back.
    #[error("persistence failure: {0}")]
    Persistence(#[from] rusqlite::Error),

    /// The outbound event queue overflowed; the client cannot keep up.
    #[error("client cannot keep up with the event stream")]
    SlowConsumer,

    /// REST projection asked for a simulation id that does not exist.
    #[error("simulation {0} not found")]
    SimulationNotFound(i64),
}

impl CoreError {
    /// Stable machine-readable discriminant for wire frames and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "InvalidRequest",
            Self::AlreadyRunning => "AlreadyRunning",
            Self::InvalidSpeed(_) => "InvalidSpeed",
            Self::InsufficientFunds { .. } => "InsufficientFunds",
            Self::InsufficientHoldings { .. } => "InsufficientHoldings",
            Self::InsufficientData => "InsufficientData",
            Self::VendorUnavailable(_) => "VendorUnavailable",
            Self::VendorRejected(_) => "VendorRejected",
            Self::RateLimited => "RateLimited",
            Self::Persistence(_) => "PersistenceFailure",
            Self::SlowConsumer => "SlowConsumer",
            Self::SimulationNotFound(_) => "SimulationNotFound",
        }
    }

    /// Whether the in-engine bounded-backoff retry loop should re-attempt a
    /// vendor call that failed with this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::VendorUnavailable(_) | Self::RateLimited)
    }
}
