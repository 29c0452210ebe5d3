//! Code-strategy backtest engine (the canonical variant).
//!
//! Loads the price frame for the requested universe/range, executes the
//! strategy in the sandbox, converts buy signals into an equal-allocation
//! buy-and-hold equity series, emits the four artifacts and persists the run
//! against a freshly built world-state manifest.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{json, Value};

use crate::backtest::metrics::compute_backtest_metrics;
use crate::code_strategy::runner::{run_code_strategy_sandbox, SandboxLimits, SandboxOutcome};
use crate::code_strategy::validator::validate_code_strategy_source;
use crate::error::{FinError, FinResult};
use crate::storage::{AnalyticsStore, RuntimePaths, StateStore};
use crate::viz::write_line_chart_svg;
use crate::world_state::build_world_state_manifest;

#[derive(Debug, Clone)]
pub struct CodeBacktestRequest {
    pub strategy_name: String,
    pub source_code: String,
    pub universe: Vec<String>,
    pub start_date: String,
    pub end_date: String,
    pub initial_capital: f64,
    pub limits: SandboxLimits,
}

fn artifact_stamp() -> String {
    chrono::Utc::now().format("%Y%m%d%H%M%S%6f").to_string()
}

fn clamp_strength(raw: Option<f64>) -> Option<f64> {
    raw.map(|value| value.clamp(0.0, 1.0))
}

/// Run a full code-strategy backtest. `extra_context` entries (e.g. the
/// tuning engine's `tuning_params`) are merged into the sandbox context.
pub async fn run_code_strategy_backtest(
    paths: &RuntimePaths,
    analytics: &AnalyticsStore,
    state: &StateStore,
    request: &CodeBacktestRequest,
    extra_context: Option<&Value>,
) -> FinResult<Value> {
    if request.universe.is_empty() {
        return Err(FinError::invalid("universe must not be empty"));
    }
    if request.initial_capital <= 0.0 {
        return Err(FinError::invalid("initial_capital must be positive"));
    }

    let validation = validate_code_strategy_source(&request.source_code)?;
    let code_version = state.save_code_strategy_version(
        &request.strategy_name,
        &request.source_code,
        &validation,
    )?;

    let rows = analytics.query_close_rows(
        &request.universe,
        &request.start_date,
        &request.end_date,
    )?;
    if rows.is_empty() {
        return Err(FinError::invalid(
            "no OHLCV rows found for requested universe/date range",
        ));
    }

    let mut frame: Vec<Value> = Vec::with_capacity(rows.len());
    let mut by_symbol: BTreeMap<String, Vec<(String, f64)>> = BTreeMap::new();
    let mut all_dates: BTreeSet<String> = BTreeSet::new();
    for row in &rows {
        frame.push(json!({
            "symbol": row.symbol,
            "timestamp": row.date,
            "close": row.close,
        }));
        by_symbol
            .entry(row.symbol.clone())
            .or_default()
            .push((row.date.clone(), row.close));
        all_dates.insert(row.date.clone());
    }

    let mut context = json!({
        "start_date": request.start_date,
        "end_date": request.end_date,
        "initial_capital": request.initial_capital,
    });
    if let Some(extra) = extra_context {
        crate::storage::deep_merge(&mut context, extra);
    }

    let sandbox: SandboxOutcome = run_code_strategy_sandbox(
        paths,
        &request.source_code,
        &request.limits,
        &json!({"universe": request.universe}),
        &Value::Array(frame),
        &context,
    )
    .await?;

    let outputs = &sandbox.outputs;
    let signals: Vec<Value> = outputs
        .get("signals")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let risk_payload = outputs
        .get("risk")
        .filter(|r| r.is_object())
        .cloned()
        .unwrap_or_else(|| json!({}));
    let risk_max_positions = risk_payload
        .get("max_positions")
        .and_then(Value::as_i64)
        .unwrap_or(request.universe.len().max(1) as i64)
        .max(1);

    let active_symbols: BTreeSet<String> = signals
        .iter()
        .filter_map(|item| {
            let symbol = item.get("symbol")?.as_str()?;
            let signal = item.get("signal")?.as_str()?;
            if signal.eq_ignore_ascii_case("buy") && by_symbol.contains_key(symbol) {
                Some(symbol.to_string())
            } else {
                None
            }
        })
        .collect();

    let ordered_dates: Vec<String> = all_dates.into_iter().collect();
    if ordered_dates.len() < 2 {
        return Err(FinError::invalid(
            "need at least two dates for code strategy backtest",
        ));
    }

    let trade_count;
    let equity_series: Vec<f64> = if active_symbols.is_empty() {
        trade_count = 0i64;
        vec![request.initial_capital; ordered_dates.len()]
    } else {
        trade_count = active_symbols.len() as i64 * 2;
        let allocation = request.initial_capital / active_symbols.len() as f64;
        let symbol_points: BTreeMap<&String, BTreeMap<&String, f64>> = by_symbol
            .iter()
            .map(|(symbol, points)| {
                (
                    symbol,
                    points.iter().map(|(day, close)| (day, *close)).collect(),
                )
            })
            .collect();
        let first_close: BTreeMap<&String, f64> = active_symbols
            .iter()
            .filter_map(|symbol| {
                by_symbol
                    .get_key_value(symbol)
                    .and_then(|(key, points)| points.first().map(|(_, close)| (key, *close)))
            })
            .collect();
        let mut last_close: BTreeMap<&String, f64> = BTreeMap::new();
        let mut series = Vec::with_capacity(ordered_dates.len());
        for day in &ordered_dates {
            let mut total = 0.0;
            for (symbol, first) in &first_close {
                if let Some(close) = symbol_points.get(*symbol).and_then(|p| p.get(day)) {
                    last_close.insert(*symbol, *close);
                }
                let close = last_close.get(*symbol).copied().unwrap_or(*first);
                total += allocation * (close / first);
            }
            series.push(total);
        }
        series
    };

    let metrics = compute_backtest_metrics(&equity_series, trade_count)?;
    let mut drawdowns = Vec::with_capacity(equity_series.len());
    let mut peak = equity_series[0];
    for &value in &equity_series {
        peak = peak.max(value);
        drawdowns.push(value / peak - 1.0);
    }

    let run_dir = paths.artifacts_dir().join("code-backtests");
    std::fs::create_dir_all(&run_dir)?;
    let stamp = artifact_stamp();
    let equity_path = run_dir.join(format!("equity-{}.svg", stamp));
    let drawdown_path = run_dir.join(format!("drawdown-{}.svg", stamp));
    let trade_path = run_dir.join(format!("trades-{}.csv", stamp));
    let signal_path = run_dir.join(format!("signals-{}.csv", stamp));
    write_line_chart_svg(
        &equity_path,
        &format!("Code Strategy Equity - {}", request.strategy_name),
        &ordered_dates,
        &equity_series,
    )?;
    write_line_chart_svg(
        &drawdown_path,
        &format!("Code Strategy Drawdown - {}", request.strategy_name),
        &ordered_dates,
        &drawdowns,
    )?;

    // Per-(symbol, day) signal context with the symbol's signal snapshot.
    let mut signal_writer = csv::Writer::from_path(&signal_path)
        .map_err(|e| FinError::Io(format!("failed to open signal csv: {}", e)))?;
    signal_writer
        .write_record(["symbol", "timestamp", "close", "signal", "strength", "reason_code"])
        .map_err(|e| FinError::Io(format!("failed to write signal csv: {}", e)))?;
    for (symbol, points) in &by_symbol {
        let signal_item = signals
            .iter()
            .find(|item| item.get("symbol").and_then(Value::as_str) == Some(symbol.as_str()));
        let signal_type = signal_item
            .and_then(|item| item.get("signal"))
            .and_then(Value::as_str)
            .unwrap_or("watch")
            .to_lowercase();
        let reason_code = signal_item
            .and_then(|item| item.get("reason_code"))
            .and_then(Value::as_str)
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("signal_{}", signal_type));
        let strength = clamp_strength(
            signal_item
                .and_then(|item| item.get("strength"))
                .and_then(Value::as_f64),
        );
        let strength_text = strength.map(|s| s.to_string()).unwrap_or_default();
        for (day, close) in points {
            signal_writer
                .write_record([
                    symbol.as_str(),
                    day.as_str(),
                    &close.to_string(),
                    &signal_type,
                    &strength_text,
                    &reason_code,
                ])
                .map_err(|e| FinError::Io(format!("failed to write signal csv: {}", e)))?;
        }
    }
    signal_writer
        .flush()
        .map_err(|e| FinError::Io(format!("failed to flush signal csv: {}", e)))?;

    // One blotter row per active symbol: first close in, last close out.
    let mut trade_writer = csv::Writer::from_path(&trade_path)
        .map_err(|e| FinError::Io(format!("failed to open trade csv: {}", e)))?;
    trade_writer
        .write_record([
            "symbol",
            "entry_ts",
            "exit_ts",
            "entry_price",
            "exit_price",
            "pnl",
            "entry_reason",
            "exit_reason",
        ])
        .map_err(|e| FinError::Io(format!("failed to write trade csv: {}", e)))?;
    for symbol in &active_symbols {
        let Some(points) = by_symbol.get(symbol) else {
            continue;
        };
        let Some(((entry_ts, entry_price), (exit_ts, exit_price))) =
            points.first().zip(points.last())
        else {
            continue;
        };
        let notional = request.initial_capital / active_symbols.len().max(1) as f64;
        let qty = if *entry_price <= 0.0 {
            0.0
        } else {
            notional / entry_price
        };
        let pnl = qty * (exit_price - entry_price);
        trade_writer
            .write_record([
                symbol.as_str(),
                entry_ts.as_str(),
                exit_ts.as_str(),
                &entry_price.to_string(),
                &exit_price.to_string(),
                &pnl.to_string(),
                "signal_buy",
                "end_of_window",
            ])
            .map_err(|e| FinError::Io(format!("failed to write trade csv: {}", e)))?;
    }
    trade_writer
        .flush()
        .map_err(|e| FinError::Io(format!("failed to flush trade csv: {}", e)))?;

    let manifest = build_world_state_manifest(
        analytics,
        state,
        &request.universe,
        &request.start_date,
        &request.end_date,
        "none",
    )?;

    let metrics_value = serde_json::to_value(metrics)?;
    let artifacts = json!({
        "equity_curve_path": equity_path.to_string_lossy(),
        "drawdown_path": drawdown_path.to_string_lossy(),
        "trade_blotter_path": trade_path.to_string_lossy(),
        "signal_context_path": signal_path.to_string_lossy(),
    });
    let run_id = state.save_backtest_run(
        &code_version.strategy_version_id,
        &manifest.manifest_id,
        &metrics_value,
        &artifacts,
        &json!({
            "mode": "code_strategy",
            "strategy_name": request.strategy_name,
            "universe": request.universe,
            "start_date": request.start_date,
            "end_date": request.end_date,
            "initial_capital": request.initial_capital,
            "strategy": {
                "strategy_name": request.strategy_name,
                "universe": request.universe,
                "start_date": request.start_date,
                "end_date": request.end_date,
                "initial_capital": request.initial_capital,
                "max_positions": risk_max_positions,
                "mode": "code_strategy",
            },
            "signals": signals,
            "risk": risk_payload,
            "sandbox_run_id": sandbox.run_id,
        }),
    )?;
    state.append_audit_event(
        "code.backtest.run",
        &json!({
            "run_id": run_id,
            "strategy_name": request.strategy_name,
            "strategy_version_id": code_version.strategy_version_id,
            "signals_count": signals.len(),
            "sandbox_run_id": sandbox.run_id,
            "metrics": metrics_value,
        }),
    )?;

    Ok(json!({
        "run_id": run_id,
        "strategy_name": request.strategy_name,
        "strategy_version_id": code_version.strategy_version_id,
        "world_manifest_id": manifest.manifest_id,
        "metrics": metrics_value,
        "artifacts": artifacts,
        "sandbox_run_id": sandbox.run_id,
        "signals_count": signals.len(),
    }))
}
