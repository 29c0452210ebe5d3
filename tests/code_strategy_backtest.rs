//! End-to-end code-strategy backtest over imported OHLCV data.

use std::io::Write;
use std::path::PathBuf;

use serde_json::Value;

use finagent_backend::code_strategy::backtest::{run_code_strategy_backtest, CodeBacktestRequest};
use finagent_backend::code_strategy::{SandboxLimits, WORKER_BIN_ENV};
use finagent_backend::data::import_ohlcv_file;
use finagent_backend::storage::{AnalyticsStore, RuntimePaths, StateStore};

const BUY_ABC: &str = r#"
fn prepare(data_bundle, context) {
    #{ universe: data_bundle.universe }
}

fn generate_signals(frame, state, context) {
    let signals = [];
    if frame.len() > 0 {
        signals.push(#{ symbol: "ABC", signal: "buy", strength: 0.9, reason_code: "momentum_up" });
    }
    signals
}

fn risk_rules(positions, context) {
    #{ max_positions: 5 }
}
"#;

fn write_rising_csv(dir: &std::path::Path) -> PathBuf {
    let path = dir.join("abc.csv");
    let mut handle = std::fs::File::create(&path).unwrap();
    writeln!(handle, "timestamp,symbol,open,high,low,close,volume").unwrap();
    for day in 1..=10 {
        let close = 100.0 + day as f64;
        writeln!(
            handle,
            "2025-01-{:02},ABC,{},{},{},{},1000",
            day,
            close - 0.5,
            close + 0.5,
            close - 1.0,
            close
        )
        .unwrap();
    }
    path
}

#[tokio::test]
async fn backtest_buy_and_hold_over_rising_closes() {
    std::env::set_var(WORKER_BIN_ENV, env!("CARGO_BIN_EXE_finagent"));
    let dir = tempfile::tempdir().unwrap();
    let paths = RuntimePaths::new(dir.path().join("agent"));
    let analytics = AnalyticsStore::in_memory().unwrap();
    let state = StateStore::in_memory().unwrap();
    let csv_path = write_rising_csv(dir.path());
    import_ohlcv_file(&analytics, &state, &csv_path).unwrap();

    let request = CodeBacktestRequest {
        strategy_name: "momentum-demo".to_string(),
        source_code: BUY_ABC.to_string(),
        universe: vec!["ABC".to_string()],
        start_date: "2025-01-01".to_string(),
        end_date: "2025-01-10".to_string(),
        initial_capital: 100_000.0,
        limits: SandboxLimits::default(),
    };
    let result = run_code_strategy_backtest(&paths, &analytics, &state, &request, None)
        .await
        .unwrap();

    assert_eq!(result["signals_count"], 1);
    assert_eq!(result["metrics"]["trade_count"], 2);
    // Monotone rising closes: no drawdown, positive return, final equity is
    // capital scaled by last/first close.
    assert_eq!(result["metrics"]["max_drawdown"], 0.0);
    let total_return = result["metrics"]["total_return"].as_f64().unwrap();
    assert!((total_return - (110.0 / 101.0 - 1.0)).abs() < 1e-9);
    let final_equity = result["metrics"]["final_equity"].as_f64().unwrap();
    assert!((final_equity - 100_000.0 * (110.0 / 101.0)).abs() < 1e-6);

    // Four artifacts on disk.
    for key in [
        "equity_curve_path",
        "drawdown_path",
        "trade_blotter_path",
        "signal_context_path",
    ] {
        let artifact = result["artifacts"][key].as_str().unwrap();
        assert!(std::path::Path::new(artifact).exists(), "missing {}", key);
    }

    // Blotter: one row, first close in, last close out.
    let blotter =
        std::fs::read_to_string(result["artifacts"]["trade_blotter_path"].as_str().unwrap())
            .unwrap();
    let mut lines = blotter.lines();
    assert_eq!(
        lines.next().unwrap(),
        "symbol,entry_ts,exit_ts,entry_price,exit_price,pnl,entry_reason,exit_reason"
    );
    let row = lines.next().unwrap();
    assert!(row.starts_with("ABC,2025-01-01,2025-01-10,101,110,"));
    assert!(row.ends_with("signal_buy,end_of_window"));

    // Signal context: one row per (symbol, day) with the signal snapshot.
    let signals =
        std::fs::read_to_string(result["artifacts"]["signal_context_path"].as_str().unwrap())
            .unwrap();
    assert_eq!(signals.lines().count(), 11);
    assert!(signals.contains("ABC,2025-01-03,103,buy,0.9,momentum_up"));

    // The run is persisted and linked to a manifest plus audit trail.
    let run = state
        .get_backtest_run(result["run_id"].as_str().unwrap())
        .unwrap();
    assert_eq!(run["payload"]["mode"], "code_strategy");
    assert_eq!(run["payload"]["signals"][0]["symbol"], "ABC");
    let audits = state.list_audit_events(Some("code.backtest.run")).unwrap();
    assert_eq!(audits.len(), 1);
}

#[tokio::test]
async fn backtest_without_buy_signals_is_flat() {
    std::env::set_var(WORKER_BIN_ENV, env!("CARGO_BIN_EXE_finagent"));
    let dir = tempfile::tempdir().unwrap();
    let paths = RuntimePaths::new(dir.path().join("agent"));
    let analytics = AnalyticsStore::in_memory().unwrap();
    let state = StateStore::in_memory().unwrap();
    let csv_path = write_rising_csv(dir.path());
    import_ohlcv_file(&analytics, &state, &csv_path).unwrap();

    let watching = r#"
fn prepare(data_bundle, context) { #{} }
fn generate_signals(frame, state, context) {
    [#{ symbol: "ABC", signal: "watch", strength: 0.5 }]
}
fn risk_rules(positions, context) { #{} }
"#;
    let request = CodeBacktestRequest {
        strategy_name: "watcher".to_string(),
        source_code: watching.to_string(),
        universe: vec!["ABC".to_string()],
        start_date: "2025-01-01".to_string(),
        end_date: "2025-01-10".to_string(),
        initial_capital: 50_000.0,
        limits: SandboxLimits::default(),
    };
    let result = run_code_strategy_backtest(&paths, &analytics, &state, &request, None)
        .await
        .unwrap();
    assert_eq!(result["metrics"]["trade_count"], 0);
    assert_eq!(result["metrics"]["total_return"], 0.0);
    assert_eq!(result["metrics"]["sharpe"], 0.0);
    assert_eq!(result["metrics"]["final_equity"], 50_000.0);
}

#[tokio::test]
async fn consecutive_saves_bump_version_numbers() {
    std::env::set_var(WORKER_BIN_ENV, env!("CARGO_BIN_EXE_finagent"));
    let dir = tempfile::tempdir().unwrap();
    let paths = RuntimePaths::new(dir.path().join("agent"));
    let analytics = AnalyticsStore::in_memory().unwrap();
    let state = StateStore::in_memory().unwrap();
    let csv_path = write_rising_csv(dir.path());
    import_ohlcv_file(&analytics, &state, &csv_path).unwrap();

    let request = CodeBacktestRequest {
        strategy_name: "versioned".to_string(),
        source_code: BUY_ABC.to_string(),
        universe: vec!["ABC".to_string()],
        start_date: "2025-01-01".to_string(),
        end_date: "2025-01-10".to_string(),
        initial_capital: 10_000.0,
        limits: SandboxLimits::default(),
    };
    let first = run_code_strategy_backtest(&paths, &analytics, &state, &request, None)
        .await
        .unwrap();
    let second = run_code_strategy_backtest(&paths, &analytics, &state, &request, None)
        .await
        .unwrap();

    let strategies = state.list_code_strategies(10).unwrap();
    assert_eq!(strategies.len(), 1);
    assert_eq!(strategies[0]["latest_version_number"], 2);
    let first_version: Value = state
        .get_code_strategy_version(first["strategy_version_id"].as_str().unwrap())
        .unwrap();
    let second_version: Value = state
        .get_code_strategy_version(second["strategy_version_id"].as_str().unwrap())
        .unwrap();
    assert_eq!(first_version["version_number"], 1);
    assert_eq!(second_version["version_number"], 2);
}
