//! Backtest result models shared by both engine variants.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BacktestMetrics {
    pub final_equity: f64,
    pub total_return: f64,
    pub cagr: f64,
    pub sharpe: f64,
    pub max_drawdown: f64,
    pub trade_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestArtifacts {
    pub equity_curve_path: String,
    pub drawdown_path: String,
    pub trade_blotter_path: Option<String>,
    pub signal_context_path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BacktestRun {
    pub run_id: String,
    pub strategy_name: String,
    pub strategy_version_id: String,
    pub world_manifest_id: String,
    pub metrics: BacktestMetrics,
    pub artifacts: BacktestArtifacts,
}

/// Classic SMA-crossover strategy definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategySpec {
    pub strategy_id: String,
    pub strategy_name: String,
    pub universe: Vec<String>,
    pub start_date: String,
    pub end_date: String,
    pub initial_capital: f64,
    pub signal_type: String,
    pub short_window: usize,
    pub long_window: usize,
    pub max_positions: usize,
    pub cost_bps: f64,
}
