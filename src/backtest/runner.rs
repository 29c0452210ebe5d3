//! Classic SMA-crossover backtest engine.
//!
//! Per-symbol cross-up entries and cross-down exits with basis-point fees,
//! forced exit at the window end. Shares the metrics routine with the
//! code-strategy engine and emits the same artifact family under
//! `artifacts/runs/`.

use std::collections::BTreeMap;

use serde_json::{json, Value};

use crate::backtest::metrics::compute_backtest_metrics;
use crate::backtest::models::{BacktestArtifacts, BacktestRun, StrategySpec};
use crate::error::{FinError, FinResult};
use crate::storage::{AnalyticsStore, RuntimePaths, StateStore};
use crate::viz::write_line_chart_svg;
use crate::world_state::WorldStateManifest;

fn moving_average(values: &[f64], window: usize) -> Vec<Option<f64>> {
    let mut result = Vec::with_capacity(values.len());
    for idx in 0..values.len() {
        if idx + 1 < window {
            result.push(None);
            continue;
        }
        let segment = &values[idx + 1 - window..=idx];
        result.push(Some(segment.iter().sum::<f64>() / window as f64));
    }
    result
}

struct OpenTrade {
    entry_ts: String,
    entry_price: f64,
}

/// Run the SMA engine over a frozen world state and persist the run.
pub fn run_backtest(
    paths: &RuntimePaths,
    analytics: &AnalyticsStore,
    state: &StateStore,
    strategy: &StrategySpec,
    manifest: &WorldStateManifest,
) -> FinResult<BacktestRun> {
    if strategy.signal_type != "sma_crossover" {
        return Err(FinError::invalid(format!(
            "unsupported signal_type: {}",
            strategy.signal_type
        )));
    }
    if strategy.short_window >= strategy.long_window {
        return Err(FinError::invalid("short_window must be less than long_window"));
    }
    if strategy.universe.len() > strategy.max_positions {
        return Err(FinError::invalid("universe size exceeds max_positions"));
    }

    let rows = analytics.query_close_rows(
        &strategy.universe,
        &strategy.start_date,
        &strategy.end_date,
    )?;
    if rows.is_empty() {
        return Err(FinError::invalid("no OHLCV rows found for strategy range"));
    }

    let mut by_symbol: BTreeMap<String, Vec<(String, f64)>> = BTreeMap::new();
    for row in rows {
        by_symbol
            .entry(row.symbol)
            .or_default()
            .push((row.date, row.close));
    }
    let missing: Vec<&String> = strategy
        .universe
        .iter()
        .filter(|symbol| !by_symbol.contains_key(*symbol))
        .collect();
    if !missing.is_empty() {
        return Err(FinError::invalid(format!(
            "missing OHLCV rows for symbols: {:?}",
            missing
        )));
    }

    let cash_per_symbol = strategy.initial_capital / strategy.universe.len() as f64;
    let fee_rate = strategy.cost_bps / 10_000.0;
    let mut trade_count = 0i64;
    let mut equity_by_date: BTreeMap<String, f64> = BTreeMap::new();
    let mut trade_rows: Vec<Value> = Vec::new();
    let mut signal_rows: Vec<Value> = Vec::new();

    for symbol in &strategy.universe {
        let points = &by_symbol[symbol];
        let closes: Vec<f64> = points.iter().map(|(_, close)| *close).collect();
        let short_ma = moving_average(&closes, strategy.short_window);
        let long_ma = moving_average(&closes, strategy.long_window);

        let mut cash = cash_per_symbol;
        let mut shares = 0.0f64;
        let mut prev_signal = false;
        let mut open_trade: Option<OpenTrade> = None;

        for (idx, (ts, close)) in points.iter().enumerate() {
            let (can_signal, buy_signal) = match (short_ma[idx], long_ma[idx]) {
                (Some(short), Some(long)) => (true, short > long),
                _ => (false, false),
            };
            let reason_code = if !can_signal {
                "insufficient_history"
            } else if buy_signal && !prev_signal {
                "sma_cross_up"
            } else if !buy_signal && prev_signal {
                "sma_cross_down"
            } else if buy_signal {
                "trend_above"
            } else {
                "trend_below"
            };

            signal_rows.push(json!({
                "symbol": symbol,
                "timestamp": ts,
                "close": close,
                "sma_short": short_ma[idx],
                "sma_long": long_ma[idx],
                "buy_signal": if buy_signal { 1.0 } else { 0.0 },
                "reason_code": reason_code,
            }));

            if buy_signal && !prev_signal && shares == 0.0 {
                let gross = cash;
                let net = gross - gross * fee_rate;
                if net <= 0.0 {
                    return Err(FinError::invalid("net capital after fees is non-positive"));
                }
                shares = net / close;
                cash = 0.0;
                trade_count += 1;
                open_trade = Some(OpenTrade {
                    entry_ts: ts.clone(),
                    entry_price: *close,
                });
            }

            if !buy_signal && prev_signal && shares > 0.0 {
                let gross = shares * close;
                cash = gross - gross * fee_rate;
                shares = 0.0;
                trade_count += 1;
                if let Some(trade) = open_trade.take() {
                    trade_rows.push(json!({
                        "symbol": symbol,
                        "entry_ts": trade.entry_ts,
                        "exit_ts": ts,
                        "entry_price": trade.entry_price,
                        "exit_price": close,
                        "pnl": cash - cash_per_symbol,
                        "entry_reason": "sma_cross_up",
                        "exit_reason": "sma_cross_down",
                    }));
                }
            }

            prev_signal = buy_signal;
            *equity_by_date.entry(ts.clone()).or_insert(0.0) += cash + shares * close;
        }

        if shares > 0.0 {
            let Some((last_ts, last_close)) = points.last() else {
                continue;
            };
            let gross = shares * last_close;
            cash = gross - gross * fee_rate;
            trade_count += 1;
            *equity_by_date.entry(last_ts.clone()).or_insert(0.0) += cash - (gross);
            if let Some(trade) = open_trade.take() {
                trade_rows.push(json!({
                    "symbol": symbol,
                    "entry_ts": trade.entry_ts,
                    "exit_ts": last_ts,
                    "entry_price": trade.entry_price,
                    "exit_price": last_close,
                    "pnl": cash - cash_per_symbol,
                    "entry_reason": "sma_cross_up",
                    "exit_reason": "end_of_window",
                }));
            }
        }
    }

    let ordered_dates: Vec<String> = equity_by_date.keys().cloned().collect();
    let equity_series: Vec<f64> = ordered_dates
        .iter()
        .map(|day| equity_by_date[day])
        .collect();
    let metrics = compute_backtest_metrics(&equity_series, trade_count)?;

    let mut drawdowns = Vec::with_capacity(equity_series.len());
    let mut peak = equity_series[0];
    for &value in &equity_series {
        peak = peak.max(value);
        drawdowns.push(value / peak - 1.0);
    }

    let run_dir = paths.artifacts_dir().join("runs");
    std::fs::create_dir_all(&run_dir)?;
    let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S%6f").to_string();
    let equity_path = run_dir.join(format!("equity-{}.svg", stamp));
    let drawdown_path = run_dir.join(format!("drawdown-{}.svg", stamp));
    let trade_path = run_dir.join(format!("trades-{}.csv", stamp));
    let signal_path = run_dir.join(format!("signals-{}.csv", stamp));

    write_line_chart_svg(
        &equity_path,
        &format!("Equity Curve - {}", strategy.strategy_name),
        &ordered_dates,
        &equity_series,
    )?;
    write_line_chart_svg(
        &drawdown_path,
        &format!("Drawdown - {}", strategy.strategy_name),
        &ordered_dates,
        &drawdowns,
    )?;

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
    for row in &trade_rows {
        trade_writer
            .write_record([
                row["symbol"].as_str().unwrap_or_default(),
                row["entry_ts"].as_str().unwrap_or_default(),
                row["exit_ts"].as_str().unwrap_or_default(),
                &row["entry_price"].to_string(),
                &row["exit_price"].to_string(),
                &row["pnl"].to_string(),
                row["entry_reason"].as_str().unwrap_or_default(),
                row["exit_reason"].as_str().unwrap_or_default(),
            ])
            .map_err(|e| FinError::Io(format!("failed to write trade csv: {}", e)))?;
    }
    trade_writer
        .flush()
        .map_err(|e| FinError::Io(format!("failed to flush trade csv: {}", e)))?;

    let mut signal_writer = csv::Writer::from_path(&signal_path)
        .map_err(|e| FinError::Io(format!("failed to open signal csv: {}", e)))?;
    signal_writer
        .write_record([
            "symbol",
            "timestamp",
            "close",
            "sma_short",
            "sma_long",
            "buy_signal",
            "reason_code",
        ])
        .map_err(|e| FinError::Io(format!("failed to write signal csv: {}", e)))?;
    for row in &signal_rows {
        let fmt_ma = |value: &Value| match value.as_f64() {
            Some(v) => v.to_string(),
            None => String::new(),
        };
        signal_writer
            .write_record([
                row["symbol"].as_str().unwrap_or_default(),
                row["timestamp"].as_str().unwrap_or_default(),
                &row["close"].to_string(),
                &fmt_ma(&row["sma_short"]),
                &fmt_ma(&row["sma_long"]),
                &row["buy_signal"].to_string(),
                row["reason_code"].as_str().unwrap_or_default(),
            ])
            .map_err(|e| FinError::Io(format!("failed to write signal csv: {}", e)))?;
    }
    signal_writer
        .flush()
        .map_err(|e| FinError::Io(format!("failed to flush signal csv: {}", e)))?;

    let spec_value = serde_json::to_value(strategy)?;
    let version_ref = state.save_strategy_version(&strategy.strategy_name, &spec_value)?;
    let metrics_value = serde_json::to_value(metrics)?;
    let artifacts = BacktestArtifacts {
        equity_curve_path: equity_path.to_string_lossy().to_string(),
        drawdown_path: drawdown_path.to_string_lossy().to_string(),
        trade_blotter_path: Some(trade_path.to_string_lossy().to_string()),
        signal_context_path: Some(signal_path.to_string_lossy().to_string()),
    };
    let run_id = state.save_backtest_run(
        &version_ref.strategy_version_id,
        &manifest.manifest_id,
        &metrics_value,
        &serde_json::to_value(&artifacts)?,
        &json!({
            "strategy": spec_value,
            "manifest": serde_json::to_value(manifest)?,
        }),
    )?;
    state.append_audit_event(
        "backtest.run",
        &json!({
            "run_id": run_id,
            "strategy_version_id": version_ref.strategy_version_id,
            "world_manifest_id": manifest.manifest_id,
            "metrics": metrics_value,
        }),
    )?;

    Ok(BacktestRun {
        run_id,
        strategy_name: strategy.strategy_name.clone(),
        strategy_version_id: version_ref.strategy_version_id,
        world_manifest_id: manifest.manifest_id.clone(),
        metrics,
        artifacts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world_state::build_world_state_manifest;

    fn seeded() -> (AnalyticsStore, StateStore, RuntimePaths, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let paths = RuntimePaths::new(dir.path());
        let analytics = AnalyticsStore::in_memory().unwrap();
        let state = StateStore::in_memory().unwrap();
        // Rising then falling closes to force a cross up and a cross down.
        let closes = [10.0, 10.0, 11.0, 12.0, 13.0, 14.0, 12.0, 10.0, 9.0, 8.0];
        let conn = analytics.conn();
        for (idx, close) in closes.iter().enumerate() {
            conn.execute(
                &format!(
                    "INSERT INTO market_ohlcv VALUES
                       ('2025-01-{day:02}', '2025-01-{day:02}', 'ABC', {c}, {c}, {c}, {c}, 100, 's.csv', 'h', '2025-01-01')",
                    day = idx + 1,
                    c = close
                ),
                [],
            )
            .unwrap();
        }
        drop(conn);
        (analytics, state, paths, dir)
    }

    fn strategy() -> StrategySpec {
        StrategySpec {
            strategy_id: "strat-sma".to_string(),
            strategy_name: "sma-demo".to_string(),
            universe: vec!["ABC".to_string()],
            start_date: "2025-01-01".to_string(),
            end_date: "2025-01-31".to_string(),
            initial_capital: 100_000.0,
            signal_type: "sma_crossover".to_string(),
            short_window: 2,
            long_window: 4,
            max_positions: 5,
            cost_bps: 0.0,
        }
    }

    #[test]
    fn test_sma_engine_trades_on_crossovers() {
        let (analytics, state, paths, _dir) = seeded();
        let manifest = build_world_state_manifest(
            &analytics,
            &state,
            &["ABC".to_string()],
            "2025-01-01",
            "2025-01-31",
            "none",
        )
        .unwrap();
        let run = run_backtest(&paths, &analytics, &state, &strategy(), &manifest).unwrap();
        assert!(run.metrics.trade_count >= 2);
        assert!(run.metrics.final_equity > 0.0);
        assert!(std::path::Path::new(&run.artifacts.equity_curve_path).exists());
        let blotter =
            std::fs::read_to_string(run.artifacts.trade_blotter_path.as_deref().unwrap()).unwrap();
        assert!(blotter.contains("sma_cross_up"));
        let signals =
            std::fs::read_to_string(run.artifacts.signal_context_path.as_deref().unwrap()).unwrap();
        assert!(signals.starts_with("symbol,timestamp,close,sma_short,sma_long,buy_signal,reason_code"));
        assert!(signals.contains("insufficient_history"));
    }

    #[test]
    fn test_sma_engine_guards() {
        let (analytics, state, paths, _dir) = seeded();
        let manifest = build_world_state_manifest(
            &analytics,
            &state,
            &["ABC".to_string()],
            "2025-01-01",
            "2025-01-31",
            "none",
        )
        .unwrap();
        let mut bad = strategy();
        bad.signal_type = "momentum".to_string();
        assert!(run_backtest(&paths, &analytics, &state, &bad, &manifest).is_err());

        let mut bad = strategy();
        bad.short_window = 4;
        bad.long_window = 4;
        assert!(run_backtest(&paths, &analytics, &state, &bad, &manifest).is_err());

        let mut bad = strategy();
        bad.max_positions = 0;
        assert!(run_backtest(&paths, &analytics, &state, &bad, &manifest).is_err());
    }
}
