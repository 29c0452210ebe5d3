//! Live snapshot and boundary-candidate selector.
//!
//! Replays the latest code-strategy version over a trailing window of closes
//! and ranks symbols by proximity to the decision boundary (strength 0.5).

use serde_json::{json, Value};

use crate::code_strategy::runner::{run_code_strategy_sandbox, SandboxLimits};
use crate::error::{FinError, FinResult};
use crate::storage::{AnalyticsStore, RuntimePaths, StateStore};
use crate::viz::write_line_chart_svg;

pub const DEFAULT_LOOKBACK_DAYS: usize = 180;

/// Runtime inputs recovered for a strategy version: its source plus the
/// universe and end date of its most recent backtest.
#[derive(Debug, Clone)]
pub struct CodeStrategyRuntime {
    pub strategy_version_id: String,
    pub strategy_name: String,
    pub source_code: String,
    pub universe: Vec<String>,
    pub end_date: String,
    pub latest_run_id: Option<String>,
}

pub fn resolve_code_strategy_runtime(
    state: &StateStore,
    strategy_version_id: &str,
) -> FinResult<CodeStrategyRuntime> {
    let version = state.get_code_strategy_version(strategy_version_id)?;
    let valid = version
        .get("validation")
        .and_then(|v| v.get("valid"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if !valid {
        return Err(FinError::invalid(format!(
            "code strategy version is not valid for runtime: strategy_version_id={}; \
             re-validate and save strategy code before activation",
            strategy_version_id
        )));
    }

    let runs = state.list_backtest_runs(Some(strategy_version_id), 1)?;
    let Some(latest_run) = runs.first() else {
        return Err(FinError::invalid(format!(
            "no backtest run found for strategy_version_id={}; \
             run a code-strategy backtest first to establish runtime universe",
            strategy_version_id
        )));
    };
    let payload = latest_run.get("payload").cloned().unwrap_or(json!({}));
    let universe: Vec<String> = payload
        .get("universe")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();
    if universe.is_empty() {
        return Err(FinError::invalid(format!(
            "backtest payload missing universe for strategy_version_id={}; \
             rerun the backtest with a non-empty universe",
            strategy_version_id
        )));
    }
    let end_date = payload
        .get("end_date")
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            FinError::invalid(format!(
                "backtest payload missing end_date for strategy_version_id={}; \
                 rerun the backtest with an explicit date range",
                strategy_version_id
            ))
        })?;

    Ok(CodeStrategyRuntime {
        strategy_version_id: version["strategy_version_id"]
            .as_str()
            .unwrap_or(strategy_version_id)
            .to_string(),
        strategy_name: version["strategy_name"].as_str().unwrap_or_default().to_string(),
        source_code: version["source_code"].as_str().unwrap_or_default().to_string(),
        universe,
        end_date,
        latest_run_id: latest_run
            .get("run_id")
            .and_then(Value::as_str)
            .map(|s| s.to_string()),
    })
}

/// Re-run the strategy over the trailing close window in live mode and emit
/// one boundary-proximity row per symbol.
pub async fn build_live_snapshot(
    paths: &RuntimePaths,
    analytics: &AnalyticsStore,
    source_code: &str,
    universe: &[String],
    end_date: &str,
    lookback_days: usize,
    limits: &SandboxLimits,
) -> FinResult<Vec<Value>> {
    if universe.is_empty() {
        return Err(FinError::invalid("universe must not be empty"));
    }
    if lookback_days == 0 {
        return Err(FinError::invalid("lookback_days must be positive"));
    }

    let mut frame: Vec<Value> = Vec::new();
    let mut latest: Vec<(String, String, f64)> = Vec::new();
    let mut sorted_universe: Vec<String> = universe.to_vec();
    sorted_universe.sort();
    for symbol in &sorted_universe {
        let closes = analytics.query_symbol_closes_until(symbol, end_date)?;
        if closes.is_empty() {
            continue;
        }
        let window_start = closes.len().saturating_sub(lookback_days);
        for (day, close) in &closes[window_start..] {
            frame.push(json!({"symbol": symbol, "timestamp": day, "close": close}));
        }
        let (last_day, last_close) = &closes[closes.len() - 1];
        latest.push((symbol.clone(), last_day.clone(), *last_close));
    }
    if latest.is_empty() {
        return Err(FinError::invalid(
            "no close rows available for live snapshot universe",
        ));
    }

    let sandbox = run_code_strategy_sandbox(
        paths,
        source_code,
        limits,
        &json!({"universe": sorted_universe}),
        &Value::Array(frame),
        &json!({"mode": "live", "end_date": end_date, "lookback_days": lookback_days}),
    )
    .await?;

    let signals: Vec<Value> = sandbox
        .outputs
        .get("signals")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut snapshot = Vec::with_capacity(latest.len());
    for (symbol, date, close) in latest {
        let signal_item = signals
            .iter()
            .find(|item| item.get("symbol").and_then(Value::as_str) == Some(symbol.as_str()));
        let action = signal_item
            .and_then(|item| item.get("signal"))
            .and_then(Value::as_str)
            .unwrap_or("hold")
            .to_lowercase();
        let strength = signal_item
            .and_then(|item| item.get("strength"))
            .and_then(Value::as_f64)
            .unwrap_or(0.5)
            .clamp(0.0, 1.0);
        let reason_code = signal_item
            .and_then(|item| item.get("reason_code"))
            .and_then(Value::as_str)
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("signal_{}", action));
        let distance = 0.5 - strength;
        snapshot.push(json!({
            "symbol": symbol,
            "date": date,
            "close": close,
            "action": action,
            "reason_code": reason_code,
            "strength": strength,
            "distance_to_boundary": distance,
            "abs_distance_to_boundary": distance.abs(),
            "score": distance.abs(),
            "similarity_basis": "distance_to_signal_decision_boundary",
        }));
    }
    Ok(snapshot)
}

/// The `top_k` rows closest to the decision boundary, ties broken by symbol.
pub fn boundary_candidates(snapshot: &[Value], top_k: usize) -> FinResult<Vec<Value>> {
    if top_k == 0 {
        return Err(FinError::invalid("top_k must be positive"));
    }
    let mut ordered: Vec<Value> = snapshot.to_vec();
    ordered.sort_by(|a, b| {
        let da = a["abs_distance_to_boundary"].as_f64().unwrap_or(f64::MAX);
        let db = b["abs_distance_to_boundary"].as_f64().unwrap_or(f64::MAX);
        da.partial_cmp(&db)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                a["symbol"]
                    .as_str()
                    .unwrap_or_default()
                    .cmp(b["symbol"].as_str().unwrap_or_default())
            })
    });
    ordered.truncate(top_k);
    Ok(ordered)
}

pub fn write_boundary_chart(
    paths: &RuntimePaths,
    strategy_version_id: &str,
    candidates: &[Value],
) -> FinResult<String> {
    let dir = paths.artifacts_dir().join("boundary");
    std::fs::create_dir_all(&dir)?;
    let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S%6f").to_string();
    let chart_path = dir.join(format!("boundary-{}-{}.svg", strategy_version_id, stamp));
    let labels: Vec<String> = candidates
        .iter()
        .map(|row| row["symbol"].as_str().unwrap_or_default().to_string())
        .collect();
    let values: Vec<f64> = candidates
        .iter()
        .map(|row| row["distance_to_boundary"].as_f64().unwrap_or(0.0))
        .collect();
    write_line_chart_svg(
        &chart_path,
        &format!("Boundary Distance - {}", strategy_version_id),
        &labels,
        &values,
    )?;
    Ok(chart_path.to_string_lossy().to_string())
}
