//! Shared backtest metrics routine.

use crate::backtest::models::BacktestMetrics;
use crate::error::{FinError, FinResult};

const TRADING_DAYS_PER_YEAR: f64 = 252.0;

/// Compute metrics over a daily equity series.
///
/// Requires at least two points and strictly positive prior equity values.
/// `max_drawdown` is reported as a non-positive number against the running
/// peak; `sharpe` is zero when returns have no variance.
pub fn compute_backtest_metrics(
    equity_by_day: &[f64],
    trade_count: i64,
) -> FinResult<BacktestMetrics> {
    if equity_by_day.len() < 2 {
        return Err(FinError::invalid("need at least 2 points to compute metrics"));
    }

    let mut returns = Vec::with_capacity(equity_by_day.len() - 1);
    for window in equity_by_day.windows(2) {
        let (prev, curr) = (window[0], window[1]);
        if prev <= 0.0 {
            return Err(FinError::invalid("equity became non-positive; metrics invalid"));
        }
        returns.push((curr - prev) / prev);
    }

    let initial = equity_by_day[0];
    let final_equity = equity_by_day[equity_by_day.len() - 1];
    let total_return = final_equity / initial - 1.0;
    let years = ((equity_by_day.len() - 1) as f64 / TRADING_DAYS_PER_YEAR)
        .max(1.0 / TRADING_DAYS_PER_YEAR);
    let cagr = (final_equity / initial).powf(1.0 / years) - 1.0;

    let mean_ret = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance = returns
        .iter()
        .map(|value| (value - mean_ret).powi(2))
        .sum::<f64>()
        / returns.len() as f64;
    let std_dev = variance.sqrt();
    let sharpe = if std_dev == 0.0 {
        0.0
    } else {
        (mean_ret / std_dev) * TRADING_DAYS_PER_YEAR.sqrt()
    };

    let mut peak = equity_by_day[0];
    let mut max_drawdown = 0.0f64;
    for &value in equity_by_day {
        peak = peak.max(value);
        max_drawdown = max_drawdown.min(value / peak - 1.0);
    }

    Ok(BacktestMetrics {
        final_equity,
        total_return,
        cagr,
        sharpe,
        max_drawdown,
        trade_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_two_points() {
        assert!(compute_backtest_metrics(&[100.0], 0).is_err());
    }

    #[test]
    fn test_rejects_non_positive_equity() {
        let err = compute_backtest_metrics(&[100.0, 0.0, 50.0], 0).unwrap_err();
        assert!(err.to_string().contains("non-positive"));
    }

    #[test]
    fn test_monotone_series_has_zero_drawdown() {
        let metrics = compute_backtest_metrics(&[100.0, 105.0, 111.0, 120.0], 2).unwrap();
        assert_eq!(metrics.max_drawdown, 0.0);
        assert!((metrics.total_return - 0.2).abs() < 1e-12);
        assert_eq!(metrics.final_equity, 120.0);
        assert_eq!(metrics.trade_count, 2);
    }

    #[test]
    fn test_constant_series_has_zero_sharpe_and_cagr() {
        let metrics = compute_backtest_metrics(&[100.0, 100.0, 100.0], 0).unwrap();
        assert_eq!(metrics.sharpe, 0.0);
        assert_eq!(metrics.cagr, 0.0);
        assert_eq!(metrics.total_return, 0.0);
    }

    #[test]
    fn test_drawdown_against_running_peak() {
        let metrics = compute_backtest_metrics(&[100.0, 120.0, 90.0, 110.0], 0).unwrap();
        assert!((metrics.max_drawdown - (90.0 / 120.0 - 1.0)).abs() < 1e-12);
        assert!(metrics.max_drawdown < 0.0);
    }

    #[test]
    fn test_cagr_annualization_floor() {
        // One step: years floor is 1/252, so cagr = ratio^252 - 1.
        let metrics = compute_backtest_metrics(&[100.0, 101.0], 0).unwrap();
        assert!((metrics.cagr - (1.01f64.powf(252.0) - 1.0)).abs() < 1e-9);
    }
}
