//! Sandbox containment: write jail, wall-clock timeout, result contract.
//!
//! These tests spawn the real worker binary (`finagent sandbox-worker`),
//! located via the env override so the test harness does not have to be the
//! worker itself.

use serde_json::json;

use finagent_backend::code_strategy::{run_code_strategy_sandbox, SandboxLimits, WORKER_BIN_ENV};
use finagent_backend::storage::RuntimePaths;

fn install_worker_bin() {
    std::env::set_var(WORKER_BIN_ENV, env!("CARGO_BIN_EXE_finagent"));
}

fn test_paths(dir: &tempfile::TempDir) -> RuntimePaths {
    RuntimePaths::new(dir.path().join("agent"))
}

const WELL_BEHAVED: &str = r#"
fn prepare(data_bundle, context) {
    #{ prepared: true }
}

fn generate_signals(frame, state, context) {
    let signals = [];
    if frame.len() > 0 {
        signals.push(#{ symbol: frame[0].symbol, signal: "buy", strength: 0.9 });
    }
    signals
}

fn risk_rules(positions, context) {
    #{ max_positions: 3 }
}
"#;

#[tokio::test]
async fn completed_run_writes_result_artifact() {
    install_worker_bin();
    let dir = tempfile::tempdir().unwrap();
    let paths = test_paths(&dir);

    let outcome = run_code_strategy_sandbox(
        &paths,
        WELL_BEHAVED,
        &SandboxLimits::default(),
        &json!({"universe": ["ABC"]}),
        &json!([{"symbol": "ABC", "timestamp": "2025-01-01", "close": 100.0}]),
        &json!({"initial_capital": 100000.0}),
    )
    .await
    .unwrap();

    assert_eq!(outcome.status, "completed");
    assert!(std::path::Path::new(&outcome.result_path).exists());
    assert_eq!(outcome.outputs["signals_count"], 1);
    assert_eq!(outcome.outputs["prepare_type"], "map");
    assert_eq!(outcome.outputs["signals_type"], "array");
    assert_eq!(outcome.outputs["risk_type"], "map");
    assert_eq!(outcome.outputs["signals"][0]["symbol"], "ABC");
}

#[tokio::test]
async fn write_outside_artifact_dir_is_blocked() {
    install_worker_bin();
    let dir = tempfile::tempdir().unwrap();
    let paths = test_paths(&dir);

    let escaping = r#"
fn prepare(data_bundle, context) {
    write_file("/tmp/forbidden-write.txt", "nope");
    #{}
}
fn generate_signals(frame, state, context) { [] }
fn risk_rules(positions, context) { #{} }
"#;
    let err = run_code_strategy_sandbox(
        &paths,
        escaping,
        &SandboxLimits::default(),
        &json!({}),
        &json!([]),
        &json!({}),
    )
    .await
    .unwrap_err();
    assert_eq!(err.code(), "sandbox_policy");
    assert!(err.to_string().contains("outside artifact dir"));
    assert!(!std::path::Path::new("/tmp/forbidden-write.txt").exists());
}

#[tokio::test]
async fn write_jail_is_per_run() {
    install_worker_bin();
    let dir = tempfile::tempdir().unwrap();
    let paths = test_paths(&dir);

    let outcome = run_code_strategy_sandbox(
        &paths,
        WELL_BEHAVED,
        &SandboxLimits::default(),
        &json!({}),
        &json!([]),
        &json!({}),
    )
    .await
    .unwrap();
    let first_artifact_dir = std::path::Path::new(&outcome.result_path)
        .parent()
        .unwrap()
        .to_string_lossy()
        .to_string();

    // A later run targeting the first run's artifact dir is still outside
    // its own jail.
    let writing = r#"
fn prepare(data_bundle, context) {
    write_file(context.target_dir + "/notes.txt", "hello");
    #{}
}
fn generate_signals(frame, state, context) { [] }
fn risk_rules(positions, context) { #{} }
"#;
    let err = run_code_strategy_sandbox(
        &paths,
        writing,
        &SandboxLimits::default(),
        &json!({}),
        &json!([]),
        &json!({"target_dir": first_artifact_dir}),
    )
    .await
    .unwrap_err();
    assert_eq!(err.code(), "sandbox_policy");
}

#[tokio::test]
async fn infinite_loop_hits_wall_clock_timeout() {
    install_worker_bin();
    let dir = tempfile::tempdir().unwrap();
    let paths = test_paths(&dir);

    let spinning = r#"
fn prepare(data_bundle, context) {
    let x = 0;
    loop { x += 1; }
}
fn generate_signals(frame, state, context) { [] }
fn risk_rules(positions, context) { #{} }
"#;
    let limits = SandboxLimits {
        timeout_seconds: 2,
        memory_mb: 256,
        cpu_seconds: 30,
    };
    let started = std::time::Instant::now();
    let err = run_code_strategy_sandbox(
        &paths,
        spinning,
        &limits,
        &json!({}),
        &json!([]),
        &json!({}),
    )
    .await
    .unwrap_err();
    assert_eq!(err.code(), "sandbox_timeout");
    // Wall clock is authoritative: killed near the limit, well before CPU cap.
    assert!(started.elapsed().as_secs() < 10);
}

#[tokio::test]
async fn broken_strategy_reports_exec_failure() {
    install_worker_bin();
    let dir = tempfile::tempdir().unwrap();
    let paths = test_paths(&dir);

    let broken = r#"
fn prepare(data_bundle, context) { this_function_does_not_exist() }
fn generate_signals(frame, state, context) { [] }
fn risk_rules(positions, context) { #{} }
"#;
    let err = run_code_strategy_sandbox(
        &paths,
        broken,
        &SandboxLimits::default(),
        &json!({}),
        &json!([]),
        &json!({}),
    )
    .await
    .unwrap_err();
    assert_eq!(err.code(), "invalid");
    assert!(err.to_string().contains("sandbox execution failed"));
}
