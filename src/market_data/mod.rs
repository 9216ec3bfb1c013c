pub mod aggregator;
pub mod candle;
pub mod source;
pub mod throttle;
pub mod vendor;

// Re-export the types most of the crate touches (e.g. `use crate::market_data::Candle`).
pub use aggregator::CandleAggregator;
pub use candle::{Candle, Interval};
pub use source::{MarketDataSource, MAX_PAGE_LIMIT};
pub use throttle::Throttle;
pub use vendor::VendorClient;
