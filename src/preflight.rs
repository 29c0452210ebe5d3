//! Preflight budgeter.
//!
//! Row-count-driven runtime estimates that gate expensive operations before
//! they start. Each `enforce_*` either returns the `(estimated, allowed)`
//! pair or refuses with a remediation hint.

use serde::Serialize;

use crate::error::{FinError, FinResult};
use crate::storage::AnalyticsStore;

const BACKTEST_SECONDS_PER_ROW: f64 = 0.0002;
const WORLD_STATE_SECONDS_PER_ROW: f64 = 0.0001;
const WORLD_STATE_SECONDS_PER_SYMBOL: f64 = 0.01;
const CUSTOM_CODE_SECONDS_PER_ROW: f64 = 0.00035;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BudgetCheck {
    pub estimated_seconds: f64,
    pub max_allowed_seconds: f64,
}

fn read_seconds_env(name: &str, default: f64) -> FinResult<f64> {
    let raw = std::env::var(name).unwrap_or_default();
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(default);
    }
    let parsed: f64 = raw
        .parse()
        .map_err(|_| FinError::invalid(format!("invalid {} value: {}", name, raw)))?;
    if parsed <= 0.0 {
        return Err(FinError::invalid(format!("{} must be positive", name)));
    }
    Ok(parsed)
}

/// Cap for backtest-shaped work, from `FIN_AGENT_MAX_BACKTEST_SECONDS`.
pub fn max_backtest_seconds() -> FinResult<f64> {
    read_seconds_env("FIN_AGENT_MAX_BACKTEST_SECONDS", 30.0)
}

/// Cap for world-state builds, from `FIN_AGENT_MAX_WORLD_STATE_SECONDS`.
pub fn max_world_state_seconds() -> FinResult<f64> {
    read_seconds_env("FIN_AGENT_MAX_WORLD_STATE_SECONDS", 20.0)
}

fn count_market_rows(
    analytics: &AnalyticsStore,
    universe: &[String],
    start_date: &str,
    end_date: &str,
) -> FinResult<i64> {
    if universe.is_empty() {
        return Err(FinError::invalid("preflight failed: universe must not be empty"));
    }
    let row_count = analytics.count_market_rows(universe, start_date, end_date)?;
    if row_count <= 0 {
        return Err(FinError::invalid(
            "preflight failed: no rows available for requested range",
        ));
    }
    Ok(row_count)
}

pub fn estimate_backtest_runtime_seconds(
    analytics: &AnalyticsStore,
    universe: &[String],
    start_date: &str,
    end_date: &str,
) -> FinResult<f64> {
    let rows = count_market_rows(analytics, universe, start_date, end_date)?;
    Ok(rows as f64 * BACKTEST_SECONDS_PER_ROW)
}

pub fn estimate_world_state_runtime_seconds(
    analytics: &AnalyticsStore,
    universe: &[String],
    start_date: &str,
    end_date: &str,
) -> FinResult<f64> {
    let rows = count_market_rows(analytics, universe, start_date, end_date)?;
    Ok(rows as f64 * WORLD_STATE_SECONDS_PER_ROW
        + universe.len() as f64 * WORLD_STATE_SECONDS_PER_SYMBOL)
}

pub fn estimate_tuning_runtime_seconds(
    num_trials: i64,
    per_trial_estimated_seconds: f64,
) -> FinResult<f64> {
    if num_trials <= 0 {
        return Err(FinError::invalid("preflight failed: num_trials must be positive"));
    }
    if per_trial_estimated_seconds <= 0.0 {
        return Err(FinError::invalid(
            "preflight failed: per_trial_estimated_seconds must be positive",
        ));
    }
    Ok(num_trials as f64 * per_trial_estimated_seconds)
}

pub fn estimate_custom_code_runtime_seconds(
    analytics: &AnalyticsStore,
    universe: &[String],
    start_date: &str,
    end_date: &str,
    complexity_multiplier: f64,
) -> FinResult<f64> {
    if complexity_multiplier <= 0.0 {
        return Err(FinError::invalid(
            "preflight failed: complexity_multiplier must be positive",
        ));
    }
    let rows = count_market_rows(analytics, universe, start_date, end_date)?;
    Ok(rows as f64 * CUSTOM_CODE_SECONDS_PER_ROW * complexity_multiplier)
}

fn check_budget(
    estimated_seconds: f64,
    max_estimated_seconds: f64,
    remediation: &str,
) -> FinResult<BudgetCheck> {
    if max_estimated_seconds <= 0.0 {
        return Err(FinError::invalid("max_estimated_seconds must be positive"));
    }
    if estimated_seconds > max_estimated_seconds {
        return Err(FinError::BudgetExceeded(format!(
            "preflight budget exceeded: estimated_seconds={:.2}, max_allowed_seconds={:.2}. {}",
            estimated_seconds, max_estimated_seconds, remediation
        )));
    }
    Ok(BudgetCheck {
        estimated_seconds,
        max_allowed_seconds: max_estimated_seconds,
    })
}

pub fn enforce_world_state_budget(
    analytics: &AnalyticsStore,
    universe: &[String],
    start_date: &str,
    end_date: &str,
    max_estimated_seconds: f64,
) -> FinResult<BudgetCheck> {
    let estimated =
        estimate_world_state_runtime_seconds(analytics, universe, start_date, end_date)?;
    check_budget(
        estimated,
        max_estimated_seconds,
        "Reduce universe size/date range before world-state build.",
    )
}

pub fn enforce_backtest_budget(
    analytics: &AnalyticsStore,
    universe: &[String],
    start_date: &str,
    end_date: &str,
    max_estimated_seconds: f64,
) -> FinResult<BudgetCheck> {
    let estimated = estimate_backtest_runtime_seconds(analytics, universe, start_date, end_date)?;
    check_budget(
        estimated,
        max_estimated_seconds,
        "Reduce universe size, shorten date range, or increase granularity.",
    )
}

pub fn enforce_tuning_budget(
    num_trials: i64,
    per_trial_estimated_seconds: f64,
    max_estimated_seconds: f64,
) -> FinResult<BudgetCheck> {
    let estimated = estimate_tuning_runtime_seconds(num_trials, per_trial_estimated_seconds)?;
    check_budget(
        estimated,
        max_estimated_seconds,
        "Reduce num_trials or per-trial compute complexity.",
    )
}

pub fn enforce_custom_code_budget(
    analytics: &AnalyticsStore,
    universe: &[String],
    start_date: &str,
    end_date: &str,
    complexity_multiplier: f64,
    max_estimated_seconds: f64,
) -> FinResult<BudgetCheck> {
    let estimated = estimate_custom_code_runtime_seconds(
        analytics,
        universe,
        start_date,
        end_date,
        complexity_multiplier,
    )?;
    check_budget(
        estimated,
        max_estimated_seconds,
        "Reduce date range, universe size, or code complexity.",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(rows: usize) -> AnalyticsStore {
        let analytics = AnalyticsStore::in_memory().unwrap();
        let conn = analytics.conn();
        for idx in 0..rows {
            conn.execute(
                &format!(
                    "INSERT INTO market_ohlcv VALUES
                       ('2025-01-{:02}', '2025-01-{:02}', 'ABC', 1, 1, 1, 1.0, 10, 's.csv', 'h', '2025-01-01')",
                    idx + 1,
                    idx + 1
                ),
                [],
            )
            .unwrap();
        }
        drop(conn);
        analytics
    }

    #[test]
    fn test_world_state_estimate_formula() {
        let analytics = seeded(10);
        let estimate = estimate_world_state_runtime_seconds(
            &analytics,
            &["ABC".to_string()],
            "2025-01-01",
            "2025-01-31",
        )
        .unwrap();
        assert!((estimate - (10.0 * 0.0001 + 0.01)).abs() < 1e-12);
    }

    #[test]
    fn test_budget_refusal_message() {
        let analytics = seeded(10);
        let err = enforce_backtest_budget(
            &analytics,
            &["ABC".to_string()],
            "2025-01-01",
            "2025-01-31",
            0.000001,
        )
        .unwrap_err();
        assert_eq!(err.code(), "budget_exceeded");
        assert!(err.to_string().contains("preflight budget exceeded"));
        assert!(err.to_string().contains("max_allowed_seconds=0.00"));
    }

    #[test]
    fn test_tuning_estimate() {
        let check = enforce_tuning_budget(4, 2.0, 10.0).unwrap();
        assert!((check.estimated_seconds - 8.0).abs() < 1e-12);
        assert!(enforce_tuning_budget(4, 3.0, 10.0).is_err());
        assert!(enforce_tuning_budget(0, 3.0, 10.0).is_err());
    }

    #[test]
    fn test_empty_range_refused() {
        let analytics = AnalyticsStore::in_memory().unwrap();
        let err = estimate_backtest_runtime_seconds(
            &analytics,
            &["ABC".to_string()],
            "2025-01-01",
            "2025-01-31",
        )
        .unwrap_err();
        assert!(err.to_string().contains("no rows available"));
    }

    #[test]
    fn test_env_caps() {
        std::env::remove_var("FIN_AGENT_MAX_BACKTEST_SECONDS");
        assert!((max_backtest_seconds().unwrap() - 30.0).abs() < 1e-12);
        std::env::set_var("FIN_AGENT_MAX_BACKTEST_SECONDS", "12.5");
        assert!((max_backtest_seconds().unwrap() - 12.5).abs() < 1e-12);
        std::env::set_var("FIN_AGENT_MAX_BACKTEST_SECONDS", "-1");
        assert!(max_backtest_seconds().is_err());
        std::env::remove_var("FIN_AGENT_MAX_BACKTEST_SECONDS");
    }
}
