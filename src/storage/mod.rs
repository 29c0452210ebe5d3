pub mod analytics_store;
pub mod paths;
pub mod state_store;

pub use analytics_store::{AnalyticsStore, CloseRow};
pub use paths::RuntimePaths;
pub use state_store::{deep_merge, kite_candle_cache_key, StateStore, StrategyVersionRef};
