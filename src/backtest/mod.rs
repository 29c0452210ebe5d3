pub mod compare;
pub mod metrics;
pub mod models;
pub mod runner;

pub use compare::compare_backtest_runs;
pub use metrics::compute_backtest_metrics;
pub use models::{BacktestArtifacts, BacktestMetrics, BacktestRun, StrategySpec};
pub use runner::run_backtest;
