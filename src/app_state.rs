// =============================================================================
// Process-wide application state
// =============================================================================
//
// Sessions are independent task trees; the only shared pieces are the config,
// the store handle, and the vendor source (which carries the process-wide
// request throttle). Everything session-local lives in the session itself.
// =============================================================================

use std::sync::Arc;

use parking_lot::RwLock;

use crate::market_data::source::MarketDataSource;
use crate::persistence::Database;
use crate::runtime_config::RuntimeConfig;

pub struct AppState {
    pub runtime_config: Arc<RwLock<RuntimeConfig>>,
    pub db: Database,
    pub market_data: Arc<dyn MarketDataSource>,
    /// Instant the server started, for uptime reporting.
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(
        config: RuntimeConfig,
        db: Database,
        market_data: Arc<dyn MarketDataSource>,
    ) -> Self {
        Self {
            runtime_config: Arc::new(RwLock::new(config)),
            db,
            market_data,
            start_time: std::time::Instant::now(),
        }
    }
}
