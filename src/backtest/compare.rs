//! Baseline/candidate run comparison.

use serde_json::{json, Value};

use crate::error::FinResult;
use crate::storage::StateStore;

const METRIC_KEYS: &[&str] = &[
    "final_equity",
    "total_return",
    "cagr",
    "sharpe",
    "max_drawdown",
    "trade_count",
];

const STRATEGY_PARAM_KEYS: &[&str] = &[
    "short_window",
    "long_window",
    "max_positions",
    "cost_bps",
    "signal_type",
];

fn metric(value: &Value, key: &str) -> f64 {
    value.get(key).and_then(Value::as_f64).unwrap_or(0.0)
}

fn metric_deltas(baseline: &Value, candidate: &Value) -> Value {
    let mut deltas = serde_json::Map::new();
    for key in METRIC_KEYS {
        deltas.insert(
            key.to_string(),
            json!(metric(candidate, key) - metric(baseline, key)),
        );
    }
    Value::Object(deltas)
}

fn likely_causes(baseline_payload: &Value, candidate_payload: &Value, deltas: &Value) -> Vec<String> {
    let mut notes = Vec::new();
    let base_strategy = baseline_payload.get("strategy").cloned().unwrap_or(json!({}));
    let cand_strategy = candidate_payload.get("strategy").cloned().unwrap_or(json!({}));

    for key in STRATEGY_PARAM_KEYS {
        if base_strategy.get(key) != cand_strategy.get(key) {
            notes.push(format!(
                "strategy parameter changed: {} baseline={} candidate={}",
                key,
                base_strategy.get(key).cloned().unwrap_or(Value::Null),
                cand_strategy.get(key).cloned().unwrap_or(Value::Null)
            ));
        }
    }

    let total_return_delta = metric(deltas, "total_return");
    if total_return_delta > 0.0 {
        notes.push(format!(
            "candidate improved total_return by {:.6}",
            total_return_delta
        ));
    } else if total_return_delta < 0.0 {
        notes.push(format!(
            "candidate reduced total_return by {:.6}",
            total_return_delta.abs()
        ));
    }

    let drawdown_delta = metric(deltas, "max_drawdown");
    if drawdown_delta < 0.0 {
        notes.push("candidate drawdown became deeper (more negative max_drawdown)".to_string());
    } else if drawdown_delta > 0.0 {
        notes.push("candidate drawdown improved (less negative max_drawdown)".to_string());
    }

    let trade_delta = metric(deltas, "trade_count");
    if trade_delta != 0.0 {
        notes.push(format!("trade_count changed by {}", trade_delta as i64));
    }

    if notes.is_empty() {
        notes.push("no clear cause identified from available metadata".to_string());
    }
    notes
}

/// Compare two persisted runs: metric deltas plus likely-cause notes derived
/// from strategy payload differences.
pub fn compare_backtest_runs(
    state: &StateStore,
    baseline_run_id: &str,
    candidate_run_id: &str,
) -> FinResult<Value> {
    let baseline = state.get_backtest_run(baseline_run_id)?;
    let candidate = state.get_backtest_run(candidate_run_id)?;

    let deltas = metric_deltas(&baseline["metrics"], &candidate["metrics"]);
    let causes = likely_causes(&baseline["payload"], &candidate["payload"], &deltas);

    Ok(json!({
        "baseline": {
            "run_id": baseline["run_id"],
            "created_at": baseline["created_at"],
            "metrics": baseline["metrics"],
        },
        "candidate": {
            "run_id": candidate["run_id"],
            "created_at": candidate["created_at"],
            "metrics": candidate["metrics"],
        },
        "metrics_delta": deltas,
        "artifact_links": {
            "baseline": baseline["artifacts"],
            "candidate": candidate["artifacts"],
        },
        "likely_causes": causes,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn save_run(state: &StateStore, sharpe: f64, short_window: i64) -> String {
        state
            .save_backtest_run(
                "version-1",
                "manifest-1",
                &json!({
                    "final_equity": 100000.0 + sharpe,
                    "total_return": 0.1 * sharpe,
                    "cagr": 0.05,
                    "sharpe": sharpe,
                    "max_drawdown": -0.1,
                    "trade_count": 4,
                }),
                &json!({"equity_curve_path": "equity.svg"}),
                &json!({"strategy": {"short_window": short_window, "long_window": 20}}),
            )
            .unwrap()
    }

    #[test]
    fn test_compare_reports_deltas_and_causes() {
        let state = StateStore::in_memory().unwrap();
        let baseline = save_run(&state, 1.0, 5);
        let candidate = save_run(&state, 2.0, 8);
        let report = compare_backtest_runs(&state, &baseline, &candidate).unwrap();
        assert!((report["metrics_delta"]["sharpe"].as_f64().unwrap() - 1.0).abs() < 1e-12);
        let causes = report["likely_causes"].as_array().unwrap();
        assert!(causes
            .iter()
            .any(|note| note.as_str().unwrap_or_default().contains("short_window")));
        assert!(causes
            .iter()
            .any(|note| note.as_str().unwrap_or_default().contains("improved total_return")));
    }

    #[test]
    fn test_compare_missing_run_not_found() {
        let state = StateStore::in_memory().unwrap();
        let baseline = save_run(&state, 1.0, 5);
        let err = compare_backtest_runs(&state, &baseline, "missing").unwrap_err();
        assert_eq!(err.code(), "not_found");
    }
}
